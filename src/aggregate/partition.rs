//! The partition aggregate: the global index of active/archiving/deactivated
//! flows, and their last-known digests.

use std::collections::{HashMap, HashSet};

use crate::events::PartitionEvent;
use crate::model::FlowId;

#[derive(Debug, Clone, Default)]
pub struct PartitionState {
    pub active: HashSet<FlowId>,
    pub archiving: HashSet<FlowId>,
    pub deactivated: HashSet<FlowId>,
    pub digests: HashMap<FlowId, String>,
}

impl PartitionState {
    pub fn apply(&mut self, event: &PartitionEvent) {
        match event {
            PartitionEvent::FlowActivated { flow_id } => {
                self.active.insert(flow_id.clone());
                self.archiving.remove(flow_id);
                self.deactivated.remove(flow_id);
            }
            PartitionEvent::FlowArchiving { flow_id } => {
                self.active.remove(flow_id);
                self.archiving.insert(flow_id.clone());
            }
            PartitionEvent::FlowDeactivated { flow_id } => {
                self.active.remove(flow_id);
                self.archiving.remove(flow_id);
                self.deactivated.insert(flow_id.clone());
            }
            PartitionEvent::FlowDigestUpdated { flow_id, digest } => {
                self.digests.insert(flow_id.clone(), digest.clone());
            }
        }
    }

    pub fn fold(events: &[PartitionEvent]) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn is_known(&self, flow_id: &FlowId) -> bool {
        self.active.contains(flow_id)
            || self.archiving.contains(flow_id)
            || self.deactivated.contains(flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_then_deactivation_moves_between_sets() {
        let mut state = PartitionState::default();
        let id = FlowId::new("f-1");
        state.apply(&PartitionEvent::FlowActivated { flow_id: id.clone() });
        assert!(state.active.contains(&id));
        state.apply(&PartitionEvent::FlowDeactivated { flow_id: id.clone() });
        assert!(!state.active.contains(&id));
        assert!(state.deactivated.contains(&id));
    }
}
