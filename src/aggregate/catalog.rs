//! The catalog aggregate: registered steps, their health, and the
//! attribute-type/cycle invariants across them.

use std::collections::HashMap;

use crate::error::{EngineError, ErrorKind};
use crate::events::CatalogEvent;
use crate::model::{AttributeType, HealthState, Name, Step, StepId};

#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    pub steps: HashMap<StepId, Step>,
    pub health: HashMap<StepId, HealthState>,
    pub attribute_types: HashMap<Name, AttributeType>,
}

impl CatalogState {
    pub fn apply(&mut self, event: &CatalogEvent) {
        match event {
            CatalogEvent::StepRegistered { step } | CatalogEvent::StepUpdated { step } => {
                self.steps.insert(step.id.clone(), (**step).clone());
            }
            CatalogEvent::StepUnregistered { step_id } => {
                self.steps.remove(step_id);
                self.health.remove(step_id);
            }
            CatalogEvent::StepHealthUpdated { step_id, health } => {
                self.health.insert(step_id.clone(), health.clone());
            }
            CatalogEvent::AttributeTypeBound { name, attr_type } => {
                self.attribute_types.insert(name.clone(), *attr_type);
            }
        }
    }

    pub fn fold(events: &[CatalogEvent]) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Validate a step's attribute types against names already bound by
    /// other steps (spec §3 invariant i) and verify the resulting
    /// step-dependency graph would stay acyclic (invariant ii).
    pub fn validate_registration(&self, step: &Step) -> Result<(), EngineError> {
        for (name, spec) in &step.attributes {
            if let Some(existing) = self.attribute_types.get(name) {
                if *existing != spec.attr_type {
                    return Err(EngineError::new(
                        ErrorKind::TypeConflict,
                        format!(
                            "attribute {name} already bound to type {existing:?}, got {:?}",
                            spec.attr_type
                        ),
                    ));
                }
            }
        }

        let mut probe = self.steps.clone();
        probe.insert(step.id.clone(), step.clone());
        if has_cycle(&probe) {
            return Err(EngineError::new(
                ErrorKind::CircularDependency,
                format!("registering step {} would introduce a dependency cycle", step.id),
            ));
        }
        Ok(())
    }
}

/// Detect a cycle in the producer -> consumer graph implied by shared
/// attribute names across all registered steps.
fn has_cycle(steps: &HashMap<StepId, Step>) -> bool {
    let mut producers: HashMap<&Name, Vec<&StepId>> = HashMap::new();
    for step in steps.values() {
        for (name, spec) in &step.attributes {
            if spec.role == crate::model::AttributeRole::Output {
                producers.entry(name).or_default().push(&step.id);
            }
        }
    }

    let mut edges: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    for step in steps.values() {
        for (name, spec) in &step.attributes {
            if spec.role != crate::model::AttributeRole::Output {
                if let Some(provider_ids) = producers.get(name) {
                    for provider in provider_ids {
                        edges.entry(&step.id).or_default().push(provider);
                    }
                }
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let mut marks: HashMap<&StepId, Mark> = steps.keys().map(|id| (id, Mark::Unvisited)).collect();

    fn visit<'a>(
        node: &'a StepId,
        edges: &HashMap<&'a StepId, Vec<&'a StepId>>,
        marks: &mut HashMap<&'a StepId, Mark>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::Visiting) => return true,
            Some(Mark::Done) => return false,
            _ => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if visit(dep, edges, marks) {
                    return true;
                }
            }
        }
        marks.insert(node, Mark::Done);
        false
    }

    let keys: Vec<&StepId> = steps.keys().collect();
    for id in keys {
        if visit(id, &edges, &mut marks) {
            return true;
        }
    }
    false
}
