//! The derived [`ExecutionPlan`] a flow runs against.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::catalog::Step;
use super::ids::{Name, StepId};

/// Which steps produce and consume a given attribute, as derived by the
/// planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeEdge {
    pub providers: Vec<StepId>,
    pub consumers: Vec<StepId>,
}

/// Attributes the planner could not route to a live provider, grouped by
/// whether the flow's initial input satisfied them anyway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExcludedAttributes {
    pub missing: Vec<Name>,
    pub satisfied: Vec<Name>,
}

/// The minimal sub-plan the planner derives for a set of goals: the steps
/// that must run, the attribute dataflow graph between them, and which
/// attributes must come from the flow's initial input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goals: Vec<StepId>,
    pub steps: HashMap<StepId, Step>,
    pub attributes: HashMap<Name, AttributeEdge>,
    pub required: Vec<Name>,
    #[serde(default)]
    pub excluded: ExcludedAttributes,
}

impl ExecutionPlan {
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Steps with no required inputs at all — candidates to start
    /// immediately once the flow is activated.
    pub fn initially_ready(&self) -> Vec<StepId> {
        self.steps
            .values()
            .filter(|step| step.required_inputs().next().is_none())
            .map(|step| step.id.clone())
            .collect()
    }
}
