//! The engine's data model (spec §3): catalog entities, the derived plan,
//! and per-flow runtime state.

mod catalog;
mod flow;
mod ids;
mod plan;

pub use catalog::{
    AttributeMapping, AttributeRole, AttributeSpec, AttributeType, BackoffType, FlowSpec,
    HealthState, HealthStatus, HttpSpec, ScriptSpec, Step, StepType, WorkConfig,
};
pub use flow::{
    Args, AttributeValue, ExecutionState, FlowState, FlowStatus, Labels, Metadata, StepStatus,
    WorkState, WorkStatus,
};
pub use ids::{EventType, FlowId, Name, StepId, Token};
pub use plan::{AttributeEdge, ExcludedAttributes, ExecutionPlan};
