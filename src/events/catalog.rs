//! Events appended to the single global catalog aggregate.

use serde::{Deserialize, Serialize};

use crate::model::{AttributeType, HealthState, Name, Step, StepId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEvent {
    StepRegistered { step: Box<Step> },
    StepUpdated { step: Box<Step> },
    StepUnregistered { step_id: StepId },
    StepHealthUpdated { step_id: StepId, health: HealthState },
    /// Recorded the first time an attribute name is registered with a type,
    /// enforcing the single-type-per-name invariant.
    AttributeTypeBound { name: Name, attr_type: AttributeType },
}

impl CatalogEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CatalogEvent::StepRegistered { .. } => "step_registered",
            CatalogEvent::StepUpdated { .. } => "step_updated",
            CatalogEvent::StepUnregistered { .. } => "step_unregistered",
            CatalogEvent::StepHealthUpdated { .. } => "step_health_updated",
            CatalogEvent::AttributeTypeBound { .. } => "attribute_type_bound",
        }
    }
}
