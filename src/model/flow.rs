//! Per-flow runtime state: [`FlowState`], [`ExecutionState`], [`WorkState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ids::{FlowId, Name, StepId, Token};
use super::plan::ExecutionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }

    /// Whether `self -> next` is an allowed flow-status transition.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        matches!(
            (self, next),
            (FlowStatus::Active, FlowStatus::Completed) | (FlowStatus::Active, FlowStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Active, Completed)
                | (Active, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    NotCompleted,
}

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Succeeded | WorkStatus::Failed)
    }

    pub fn can_transition_to(self, next: WorkStatus) -> bool {
        use WorkStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Succeeded)
                | (Active, Failed)
                | (Active, NotCompleted)
                | (NotCompleted, Pending)
        )
    }
}

/// Arbitrary JSON arguments passed to/from steps and flows.
pub type Args = HashMap<String, Value>;
pub type Metadata = HashMap<String, Value>;
pub type Labels = HashMap<String, String>;

/// One dispatch attempt for a step. Identity (`token`) is stable across
/// retries; only status/retry bookkeeping mutate in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkState {
    pub token: Token,
    pub status: WorkStatus,
    pub inputs: Args,
    pub outputs: Option<Args>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkState {
    pub fn new(token: Token, inputs: Args) -> Self {
        Self {
            token,
            status: WorkStatus::Pending,
            inputs,
            outputs: None,
            retry_count: 0,
            next_retry_at: None,
            error: None,
        }
    }
}

/// The execution record for one step within one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: StepStatus,
    pub inputs: Option<Args>,
    pub outputs: Option<Args>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub work_items: HashMap<Token, WorkState>,
    /// The instant this step's required inputs all became available; the
    /// anchor for optional-input fallback timeouts.
    pub ready_at: Option<DateTime<Utc>>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            inputs: None,
            outputs: None,
            started_at: None,
            error: None,
            work_items: HashMap::new(),
            ready_at: None,
        }
    }
}

impl ExecutionState {
    pub fn has_active_work(&self) -> bool {
        self.work_items
            .values()
            .any(|w| matches!(w.status, WorkStatus::Active | WorkStatus::Pending))
    }
}

/// The full state of one flow instance, reconstructable purely by replaying
/// its event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub id: FlowId,
    pub status: FlowStatus,
    pub plan: ExecutionPlan,
    pub init: Args,
    pub metadata: Metadata,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attributes: HashMap<Name, AttributeValue>,
    pub executions: HashMap<StepId, ExecutionState>,
    pub deactivated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeValue {
    pub value: Value,
    pub step_id: StepId,
}

impl FlowState {
    pub fn new(id: FlowId, plan: ExecutionPlan, init: Args, metadata: Metadata, labels: Labels, now: DateTime<Utc>) -> Self {
        let executions = plan
            .steps
            .keys()
            .map(|id| (id.clone(), ExecutionState::default()))
            .collect();
        Self {
            id,
            status: FlowStatus::Active,
            plan,
            init,
            metadata,
            labels,
            created_at: now,
            completed_at: None,
            error: None,
            attributes: HashMap::new(),
            executions: executions,
            deactivated: false,
        }
    }

    pub fn execution(&self, step: &StepId) -> Option<&ExecutionState> {
        self.executions.get(step)
    }

    pub fn has_in_flight_work(&self) -> bool {
        self.executions.values().any(|e| e.has_active_work())
    }
}
