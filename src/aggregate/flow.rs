//! The flow aggregate applier: folds a [`FlowEvent`] stream into a
//! [`FlowState`].
//!
//! The first event in any flow stream must be `FlowStarted`; every other
//! variant mutates an already-constructed state. This mirrors the teacher's
//! workflow appliers, generalized from a single typed state machine to the
//! data-driven per-flow state the catalog/plan describe.

use chrono::{DateTime, Utc};

use crate::events::FlowEvent;
use crate::model::{
    AttributeValue, ExecutionState, FlowState, FlowStatus, StepStatus, WorkState, WorkStatus,
};

/// Apply one event onto flow state. `state` is `None` until `FlowStarted`
/// is replayed.
pub fn apply(state: &mut Option<FlowState>, event: &FlowEvent, recorded_at: DateTime<Utc>) {
    match event {
        FlowEvent::FlowStarted {
            plan,
            init,
            metadata,
            labels,
        } => {
            // The flow id itself is carried by the aggregate id, not the
            // event; callers fill it in via `with_id` after folding, since
            // the applier only ever sees the event stream.
            let mut new_state = FlowState::new(
                crate::model::FlowId::new(""),
                (**plan).clone(),
                init.clone(),
                metadata.clone(),
                labels.clone(),
                recorded_at,
            );
            new_state.status = FlowStatus::Active;
            *state = Some(new_state);
        }
        _ => {
            let Some(flow) = state.as_mut() else {
                return;
            };
            apply_to_existing(flow, event, recorded_at);
        }
    }
}

fn apply_to_existing(flow: &mut FlowState, event: &FlowEvent, recorded_at: DateTime<Utc>) {
    match event {
        FlowEvent::FlowStarted { .. } => unreachable!("handled by apply()"),
        FlowEvent::StepReady { step_id } => {
            let exec = flow.executions.entry(step_id.clone()).or_default();
            if exec.ready_at.is_none() {
                exec.ready_at = Some(recorded_at);
            }
        }
        FlowEvent::StepStarted {
            step_id,
            inputs,
            work_items,
        } => {
            let exec = flow.executions.entry(step_id.clone()).or_default();
            exec.status = StepStatus::Active;
            exec.inputs = Some(inputs.clone());
            exec.started_at = Some(recorded_at);
            for (token, item_inputs) in work_items {
                exec.work_items
                    .insert(token.clone(), WorkState::new(token.clone(), item_inputs.clone()));
            }
            if work_items.is_empty() {
                // Vacuous ForEach-over-empty-array: immediately complete.
                exec.status = StepStatus::Completed;
                exec.outputs = Some(Default::default());
            }
        }
        FlowEvent::WorkStarted { step_id, token } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Active;
                }
            }
        }
        FlowEvent::WorkSucceeded {
            step_id,
            token,
            outputs,
        } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Succeeded;
                    work.outputs = Some(outputs.clone());
                    work.error = None;
                }
            }
        }
        FlowEvent::WorkFailed {
            step_id,
            token,
            error,
        } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Failed;
                    work.error = Some(error.clone());
                }
            }
        }
        FlowEvent::WorkNotCompleted {
            step_id,
            token,
            error,
        } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::NotCompleted;
                    work.error = Some(error.clone());
                }
            }
        }
        FlowEvent::RetryScheduled {
            step_id,
            token,
            next,
        } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                if let Some(work) = exec.work_items.get_mut(token) {
                    work.status = WorkStatus::Pending;
                    work.retry_count += 1;
                    work.next_retry_at = Some(*next);
                }
            }
        }
        FlowEvent::AttributeSet {
            key,
            value,
            step_id,
        } => {
            // Write-once: first writer wins (spec §3 invariant i).
            flow.attributes.entry(key.clone()).or_insert_with(|| AttributeValue {
                value: value.clone(),
                step_id: step_id.clone(),
            });
        }
        FlowEvent::StepCompleted {
            step_id,
            outputs,
            duration_ms: _,
        } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                exec.status = StepStatus::Completed;
                exec.outputs = Some(outputs.clone());
            }
        }
        FlowEvent::StepFailed { step_id, reason } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                exec.status = StepStatus::Failed;
                exec.error = Some(reason.clone());
            }
        }
        FlowEvent::StepSkipped { step_id, reason } => {
            if let Some(exec) = flow.executions.get_mut(step_id) {
                exec.status = StepStatus::Skipped;
                exec.error = Some(reason.clone());
            }
        }
        FlowEvent::FlowCompleted { result } => {
            flow.status = FlowStatus::Completed;
            flow.completed_at = Some(recorded_at);
            for (name, value) in result {
                flow.metadata.entry(format!("result.{name}")).or_insert(value.clone());
            }
        }
        FlowEvent::FlowFailed { reason } => {
            flow.status = FlowStatus::Failed;
            flow.completed_at = Some(recorded_at);
            flow.error = Some(reason.clone());
        }
        FlowEvent::FlowDeactivated => {
            flow.deactivated = true;
        }
    }
}

/// Fold a full event stream (with recorded timestamps) into a `FlowState`,
/// then stamp in the flow id (not itself part of the event payload).
pub fn fold(events: &[(FlowEvent, DateTime<Utc>)], flow_id: &crate::model::FlowId) -> Option<FlowState> {
    let mut state: Option<FlowState> = None;
    for (event, at) in events {
        apply(&mut state, event, *at);
    }
    if let Some(flow) = state.as_mut() {
        flow.id = flow_id.clone();
    }
    state
}
