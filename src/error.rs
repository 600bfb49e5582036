//! The unified error kind for the engine and its top-level error type.

use thiserror::Error;

/// The closed set of error kinds the engine can surface to a caller.
///
/// Every fallible public operation returns one of these kinds, carried by
/// [`EngineError`]. Internal collaborators (store, scheduler, planner) use
/// their own narrower error enums and convert into this one at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FlowNotFound,
    FlowExists,
    StepNotFound,
    StepExists,
    StepNotInPlan,
    WorkItemNotFound,
    InvalidWorkTransition,
    InvalidStepTransition,
    InvalidFlowCursor,
    TypeConflict,
    CircularDependency,
    InvalidStep,
    LanguageNotValid,
    UnsupportedLanguage,
    InvariantViolated,
    /// Sentinel kind: "accepted, will report the outcome later".
    WorkNotCompleted,
    TransactionConflict,
    EventHandlerPanicked,
}

impl ErrorKind {
    /// Whether this kind represents the async "not completed yet" sentinel
    /// rather than a true failure.
    pub fn is_sentinel(self) -> bool {
        matches!(self, ErrorKind::WorkNotCompleted)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::FlowNotFound => "flow_not_found",
            ErrorKind::FlowExists => "flow_exists",
            ErrorKind::StepNotFound => "step_not_found",
            ErrorKind::StepExists => "step_exists",
            ErrorKind::StepNotInPlan => "step_not_in_plan",
            ErrorKind::WorkItemNotFound => "work_item_not_found",
            ErrorKind::InvalidWorkTransition => "invalid_work_transition",
            ErrorKind::InvalidStepTransition => "invalid_step_transition",
            ErrorKind::InvalidFlowCursor => "invalid_flow_cursor",
            ErrorKind::TypeConflict => "type_conflict",
            ErrorKind::CircularDependency => "circular_dependency",
            ErrorKind::InvalidStep => "invalid_step",
            ErrorKind::LanguageNotValid => "language_not_valid",
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::InvariantViolated => "invariant_violated",
            ErrorKind::WorkNotCompleted => "work_not_completed",
            ErrorKind::TransactionConflict => "transaction_conflict",
            ErrorKind::EventHandlerPanicked => "event_handler_panicked",
        };
        write!(f, "{s}")
    }
}

/// The engine's top-level error type.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn flow_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::FlowNotFound, format!("flow {id} not found"))
    }

    pub fn step_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::StepNotFound, format!("step {id} not found"))
    }

    /// The sentinel error a step client returns to mean "accepted, will
    /// callback with the real outcome later".
    pub fn work_not_completed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkNotCompleted, reason.into())
    }

    pub fn is_sentinel(&self) -> bool {
        self.kind.is_sentinel()
    }
}

impl From<crate::store::StoreError> for EngineError {
    fn from(e: crate::store::StoreError) -> Self {
        match &e {
            crate::store::StoreError::Conflict { .. } => {
                Self::with_source(ErrorKind::TransactionConflict, e.to_string(), e.into())
            }
            _ => Self::with_source(ErrorKind::InvariantViolated, e.to_string(), e.into()),
        }
    }
}
