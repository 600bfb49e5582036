//! Events appended to the single global partition aggregate.
//!
//! These are delivered through the [`crate::event_queue::EventQueue`] rather
//! than synchronously inside a flow transaction, so the partition index is
//! only ever eventually consistent with flow status.

use serde::{Deserialize, Serialize};

use crate::model::FlowId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionEvent {
    FlowActivated { flow_id: FlowId },
    FlowArchiving { flow_id: FlowId },
    FlowDeactivated { flow_id: FlowId },
    FlowDigestUpdated { flow_id: FlowId, digest: String },
}

impl PartitionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PartitionEvent::FlowActivated { .. } => "flow_activated",
            PartitionEvent::FlowArchiving { .. } => "flow_archiving",
            PartitionEvent::FlowDeactivated { .. } => "flow_deactivated",
            PartitionEvent::FlowDigestUpdated { .. } => "flow_digest_updated",
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        match self {
            PartitionEvent::FlowActivated { flow_id }
            | PartitionEvent::FlowArchiving { flow_id }
            | PartitionEvent::FlowDeactivated { flow_id }
            | PartitionEvent::FlowDigestUpdated { flow_id, .. } => flow_id,
        }
    }
}
