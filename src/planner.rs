//! The dataflow planner (spec §4.4): derives the minimal execution plan for
//! a set of goals by backward reachability over the catalog's attribute
//! graph.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::aggregate::CatalogState;
use crate::error::{EngineError, ErrorKind};
use crate::model::{
    AttributeEdge, AttributeRole, ExcludedAttributes, ExecutionPlan, Name, Step, StepId,
};

/// Whether `name` can ultimately be produced, given `init` already supplies
/// some attributes directly. Memoized and cycle-guarded, though the catalog
/// itself should already reject cyclic attribute graphs at registration
/// time (spec §3 invariant ii).
fn is_satisfiable(
    name: &Name,
    catalog: &CatalogState,
    init: &HashSet<Name>,
    memo: &mut HashMap<Name, bool>,
    visiting: &mut HashSet<Name>,
) -> bool {
    if init.contains(name) {
        return true;
    }
    if let Some(cached) = memo.get(name) {
        return *cached;
    }
    if visiting.contains(name) {
        return false;
    }
    visiting.insert(name.clone());

    let result = catalog
        .steps
        .values()
        .filter(|step| {
            step.attributes
                .get(name)
                .map(|spec| spec.role == AttributeRole::Output)
                .unwrap_or(false)
        })
        .any(|provider| {
            provider
                .required_inputs()
                .all(|(req_name, _)| is_satisfiable(req_name, catalog, init, memo, visiting))
        });

    visiting.remove(name);
    memo.insert(name.clone(), result);
    result
}

fn providers_of<'a>(catalog: &'a CatalogState, name: &Name) -> impl Iterator<Item = &'a Step> {
    catalog.steps.values().filter(move |step| {
        step.attributes
            .get(name)
            .map(|spec| spec.role == AttributeRole::Output)
            .unwrap_or(false)
    })
}

/// Derive an [`ExecutionPlan`] for `goals` from the registered catalog,
/// given the flow's initial inputs.
pub fn plan(
    catalog: &CatalogState,
    goals: &[StepId],
    init_keys: &HashSet<Name>,
) -> Result<ExecutionPlan, EngineError> {
    let mut needed: HashSet<StepId> = HashSet::new();
    let mut queue: VecDeque<StepId> = goals.iter().cloned().collect();
    let mut memo = HashMap::new();

    let mut required: HashSet<Name> = HashSet::new();
    let mut excluded_missing: HashSet<Name> = HashSet::new();
    let mut excluded_satisfied: HashSet<Name> = HashSet::new();

    while let Some(step_id) = queue.pop_front() {
        if needed.contains(&step_id) {
            continue;
        }
        let step = catalog.steps.get(&step_id).ok_or_else(|| {
            EngineError::new(
                ErrorKind::StepNotFound,
                format!("goal step {step_id} is not registered"),
            )
        })?;
        needed.insert(step_id.clone());

        for (name, spec) in &step.attributes {
            if spec.role == AttributeRole::Output {
                continue;
            }
            if init_keys.contains(name) {
                if spec.role == AttributeRole::Required {
                    required.insert(name.clone());
                } else {
                    excluded_satisfied.insert(name.clone());
                }
                continue;
            }
            let mut visiting = HashSet::new();
            let satisfiable = is_satisfiable(name, catalog, init_keys, &mut memo, &mut visiting);

            if !satisfiable {
                if spec.role == AttributeRole::Required {
                    required.insert(name.clone());
                } else {
                    excluded_missing.insert(name.clone());
                }
                continue;
            }

            for provider in providers_of(catalog, name) {
                let provider_satisfiable = provider
                    .required_inputs()
                    .all(|(req, _)| {
                        let mut v = HashSet::new();
                        init_keys.contains(req) || is_satisfiable(req, catalog, init_keys, &mut memo, &mut v)
                    });
                if provider_satisfiable && !needed.contains(&provider.id) {
                    queue.push_back(provider.id.clone());
                }
            }
        }
    }

    let steps: HashMap<StepId, Step> = needed
        .iter()
        .map(|id| (id.clone(), catalog.steps[id].clone()))
        .collect();

    let mut attributes: HashMap<Name, AttributeEdge> = HashMap::new();
    for step in steps.values() {
        for (name, spec) in &step.attributes {
            let edge = attributes.entry(name.clone()).or_default();
            match spec.role {
                AttributeRole::Output => edge.providers.push(step.id.clone()),
                AttributeRole::Required | AttributeRole::Optional => {
                    edge.consumers.push(step.id.clone())
                }
            }
        }
    }

    Ok(ExecutionPlan {
        goals: goals.to_vec(),
        steps,
        attributes,
        required: required.into_iter().collect(),
        excluded: ExcludedAttributes {
            missing: excluded_missing.into_iter().collect(),
            satisfied: excluded_satisfied.into_iter().collect(),
        },
    })
}
