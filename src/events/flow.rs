//! Events appended to a flow aggregate's stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Args, ExecutionPlan, Labels, Metadata, Name, StepId, Token};

/// The only mutations a flow aggregate ever records.
///
/// Appliers must be deterministic and total: replaying this enum in order
/// from empty state always reconstructs the same [`crate::model::FlowState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        plan: Box<ExecutionPlan>,
        init: Args,
        metadata: Metadata,
        labels: Labels,
    },
    /// Recorded the first time a step's required inputs are all satisfied.
    /// The anchor for that step's optional-input fallback timeouts; replaying
    /// it again (it never is, by construction) would be a no-op since
    /// `ready_at` is write-once.
    StepReady {
        step_id: StepId,
    },
    StepStarted {
        step_id: StepId,
        inputs: Args,
        /// token -> per-item inputs; empty for a vacuously-complete `ForEach`
        /// over an empty array.
        work_items: Vec<(Token, Args)>,
    },
    WorkStarted {
        step_id: StepId,
        token: Token,
    },
    WorkSucceeded {
        step_id: StepId,
        token: Token,
        outputs: Args,
    },
    WorkFailed {
        step_id: StepId,
        token: Token,
        error: String,
    },
    WorkNotCompleted {
        step_id: StepId,
        token: Token,
        error: String,
    },
    RetryScheduled {
        step_id: StepId,
        token: Token,
        next: chrono::DateTime<chrono::Utc>,
    },
    AttributeSet {
        key: Name,
        value: Value,
        step_id: StepId,
    },
    StepCompleted {
        step_id: StepId,
        outputs: Args,
        duration_ms: i64,
    },
    StepFailed {
        step_id: StepId,
        reason: String,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
    FlowCompleted {
        result: Args,
    },
    FlowFailed {
        reason: String,
    },
    FlowDeactivated,
}

impl FlowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow_started",
            FlowEvent::StepReady { .. } => "step_ready",
            FlowEvent::StepStarted { .. } => "step_started",
            FlowEvent::WorkStarted { .. } => "work_started",
            FlowEvent::WorkSucceeded { .. } => "work_succeeded",
            FlowEvent::WorkFailed { .. } => "work_failed",
            FlowEvent::WorkNotCompleted { .. } => "work_not_completed",
            FlowEvent::RetryScheduled { .. } => "retry_scheduled",
            FlowEvent::AttributeSet { .. } => "attribute_set",
            FlowEvent::StepCompleted { .. } => "step_completed",
            FlowEvent::StepFailed { .. } => "step_failed",
            FlowEvent::StepSkipped { .. } => "step_skipped",
            FlowEvent::FlowCompleted { .. } => "flow_completed",
            FlowEvent::FlowFailed { .. } => "flow_failed",
            FlowEvent::FlowDeactivated => "flow_deactivated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowEvent::FlowCompleted { .. } | FlowEvent::FlowFailed { .. }
        )
    }
}
