//! The flow orchestrator (spec §4.3-§4.10): the state machine that drives a
//! flow from activation through completion by reacting to attribute
//! dataflow, work-item outcomes, and wall-clock timeouts.
//!
//! Every mutation goes through [`Executor::exec_flow`] so it is durable
//! before any side effect (dispatching a step, arming a scheduler task)
//! happens. Synchronous evaluation (predicates, memo lookups) runs inside
//! the transaction closure; external step dispatch is deferred to an
//! after-commit hook that spawns its own task, since [`StepClient::invoke`]
//! is async and a transaction closure is not.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::event_queue::EventQueue;
use crate::events::{FlowEvent, PartitionEvent};
use crate::executor::{Executor, FlowTransaction};
use crate::memo::MemoCache;
use crate::model::{
    Args, ExecutionPlan, ExecutionState, FlowId, FlowState, FlowStatus, Labels, Metadata, Name,
    Step, StepId, StepStatus, StepType, Token, WorkStatus,
};
use crate::reliability::{calculate_next_retry, should_retry};
use crate::scheduler::TaskScheduler;
use crate::script::ScriptRegistry;
use crate::store::EventStore;
use crate::work_executor::{aggregate_outputs, StepClient, StepInvocation, StepOutcome};

/// Well-known `FlowState::metadata` keys a child flow carries to link back
/// to the parent work item `maybe_deactivate` completes on its behalf.
/// Validated for all-or-nothing presence by `engine::FlowOptions::validate`.
pub(crate) const PARENT_FLOW_ID_KEY: &str = "parent_flow_id";
pub(crate) const PARENT_STEP_ID_KEY: &str = "parent_step_id";
pub(crate) const PARENT_WORK_ITEM_TOKEN_KEY: &str = "parent_work_item_token";

/// The outcome of one dispatched work item, normalized from [`StepOutcome`]
/// (or a webhook callback) before it is folded back into flow state.
enum WorkResult {
    Succeeded(Args),
    Failed(String),
    NotCompleted(String),
}

/// Whether a step's inputs are fully resolved, still blocked on a required
/// input, or waiting out an optional-input fallback race.
enum Readiness {
    NotReady,
    /// Required inputs are all satisfied; these optional attributes are
    /// still unset and have a configured timeout to race against.
    Waiting(Vec<(Name, std::time::Duration)>),
    Ready(Args),
}

fn attribute_value(flow: &FlowState, name: &Name) -> Option<Value> {
    flow.attributes
        .get(name)
        .map(|v| v.value.clone())
        .or_else(|| flow.init.get(name.as_str()).cloned())
}

fn default_value(spec: &crate::model::AttributeSpec) -> Value {
    spec.default
        .as_deref()
        .and_then(|d| serde_json::from_str(d).ok())
        .unwrap_or(Value::Null)
}

fn resolve(flow: &FlowState, step: &Step, force_expire: &HashSet<Name>) -> Readiness {
    let mut inputs = Args::new();

    for (name, _) in step.required_inputs() {
        match attribute_value(flow, name) {
            Some(value) => {
                inputs.insert(name.to_string(), value);
            }
            None => return Readiness::NotReady,
        }
    }

    let mut waiting = Vec::new();
    for (name, spec) in step.optional_inputs() {
        if let Some(value) = attribute_value(flow, name) {
            inputs.insert(name.to_string(), value);
            continue;
        }
        if force_expire.contains(name) {
            inputs.insert(name.to_string(), default_value(spec));
            continue;
        }
        match spec.timeout {
            Some(timeout) => waiting.push((name.clone(), timeout)),
            None => {
                inputs.insert(name.to_string(), default_value(spec));
            }
        }
    }

    if waiting.is_empty() {
        Readiness::Ready(inputs)
    } else {
        Readiness::Waiting(waiting)
    }
}

/// Mark any `Pending` step Failed if one of its required attributes can no
/// longer be produced: every potential provider is itself terminal-failed or
/// skipped, and the attribute isn't otherwise already set. Runs to a fixed
/// point so a failure cascades through the chain of its own dependents.
/// Returns whether anything changed.
fn check_unreachable_cmd(flow: &FlowState, tx: &mut FlowTransaction, seed: &[StepId]) -> bool {
    let mut dead: HashSet<StepId> = flow
        .executions
        .iter()
        .filter(|(_, e)| matches!(e.status, StepStatus::Failed | StepStatus::Skipped))
        .map(|(id, _)| id.clone())
        .collect();
    for id in seed {
        dead.insert(id.clone());
    }

    let mut any = false;
    let mut changed = true;
    while changed {
        changed = false;
        for step in flow.plan.steps.values() {
            if dead.contains(&step.id) {
                continue;
            }
            let Some(exec) = flow.execution(&step.id) else {
                continue;
            };
            if exec.status != StepStatus::Pending {
                continue;
            }
            let blocked_name = step.required_inputs().find_map(|(name, _)| {
                if attribute_value(flow, name).is_some() {
                    return None;
                }
                match flow.plan.attributes.get(name) {
                    Some(edge) if !edge.providers.is_empty() => {
                        if edge.providers.iter().all(|p| dead.contains(p)) {
                            Some(name.clone())
                        } else {
                            None
                        }
                    }
                    _ => Some(name.clone()),
                }
            });
            if let Some(name) = blocked_name {
                tx.emit(FlowEvent::StepFailed {
                    step_id: step.id.clone(),
                    reason: format!("required input no longer available: {name}"),
                });
                dead.insert(step.id.clone());
                changed = true;
                any = true;
            }
        }
    }
    any
}

/// Mark any `Pending`, non-goal step Skipped once none of its outputs are
/// still needed: every consumer of every attribute it produces is already
/// terminal. Runs to a fixed point. Returns whether anything changed.
fn skip_pending_unused_cmd(flow: &FlowState, tx: &mut FlowTransaction) -> bool {
    let mut resolved: HashSet<StepId> = HashSet::new();
    let mut any = false;
    let mut changed = true;
    while changed {
        changed = false;
        for step in flow.plan.steps.values() {
            if resolved.contains(&step.id) || flow.plan.goals.contains(&step.id) {
                continue;
            }
            let Some(exec) = flow.execution(&step.id) else {
                continue;
            };
            if exec.status != StepStatus::Pending {
                continue;
            }

            let mut has_output = false;
            let still_needed = step.outputs().any(|(name, _)| {
                has_output = true;
                match flow.plan.attributes.get(name) {
                    Some(edge) => edge.consumers.iter().any(|consumer| {
                        if *consumer == step.id || resolved.contains(consumer) {
                            return false;
                        }
                        flow.execution(consumer)
                            .map(|e| !e.status.is_terminal())
                            .unwrap_or(false)
                    }),
                    None => false,
                }
            });

            if has_output && !still_needed {
                tx.emit(FlowEvent::StepSkipped {
                    step_id: step.id.clone(),
                    reason: "outputs not needed".into(),
                });
                resolved.insert(step.id.clone());
                changed = true;
                any = true;
            }
        }
    }
    any
}

fn flow_digest(flow: &FlowState, status: FlowStatus) -> String {
    let mut hasher = Sha256::new();
    hasher.update(flow.id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{status:?}").as_bytes());
    hasher.update([0u8]);
    hasher.update((flow.attributes.len() as u64).to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Read a child flow's parent-work-item linkage back out of its metadata, if
/// present. `engine::FlowOptions::validate` already guarantees all three
/// keys are present together, so any one of them missing or non-string here
/// means no linkage at all rather than a partial one.
fn parent_link(metadata: &Metadata) -> Option<(FlowId, StepId, Token)> {
    let flow_id = metadata.get(PARENT_FLOW_ID_KEY)?.as_str()?;
    let step_id = metadata.get(PARENT_STEP_ID_KEY)?.as_str()?;
    let token = metadata.get(PARENT_WORK_ITEM_TOKEN_KEY)?.as_str()?;
    Some((FlowId::new(flow_id), StepId::new(step_id), Token::new(token)))
}

/// The same per-goal namespaced result `check_terminal` emits on
/// `FlowCompleted`, rebuilt from the flow's current attributes so
/// `maybe_deactivate` can hand it to a parent work item.
fn goal_result(flow: &FlowState) -> Args {
    let mut result = Args::new();
    for goal in &flow.plan.goals {
        if let Some(exec) = flow.execution(goal) {
            if let Some(outputs) = &exec.outputs {
                for (name, value) in outputs {
                    result.insert(format!("{goal}.{name}"), value.clone());
                }
            }
        }
    }
    result
}

/// Drives every flow instance's lifecycle: activation, step preparation,
/// work dispatch, retries, optional-input timeouts, and termination.
pub struct FlowOrchestrator<S: EventStore> {
    executor: Arc<Executor<S>>,
    scheduler: Arc<TaskScheduler>,
    clock: Arc<dyn Clock>,
    scripts: Arc<ScriptRegistry>,
    memo: Arc<MemoCache>,
    step_client: Arc<dyn StepClient>,
    partition_queue: Arc<EventQueue>,
    config: EngineConfig,
}

impl<S: EventStore + 'static> FlowOrchestrator<S> {
    pub fn new(
        executor: Arc<Executor<S>>,
        scheduler: Arc<TaskScheduler>,
        clock: Arc<dyn Clock>,
        scripts: Arc<ScriptRegistry>,
        memo: Arc<MemoCache>,
        step_client: Arc<dyn StepClient>,
        partition_queue: Arc<EventQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            scheduler,
            clock,
            scripts,
            memo,
            step_client,
            partition_queue,
            config,
        }
    }

    pub fn executor(&self) -> &Arc<Executor<S>> {
        &self.executor
    }

    /// Start a new flow instance and kick off every step with no required
    /// inputs.
    pub async fn start_flow(
        self: &Arc<Self>,
        flow_id: FlowId,
        plan: ExecutionPlan,
        init: Args,
        metadata: Metadata,
        labels: Labels,
    ) -> Result<FlowState, EngineError> {
        let target = flow_id.clone();
        let (state, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                if current.is_some() {
                    return Err(EngineError::new(
                        ErrorKind::FlowExists,
                        format!("flow {target} already started"),
                    ));
                }
                tx.emit(FlowEvent::FlowStarted {
                    plan: Box::new(plan.clone()),
                    init: init.clone(),
                    metadata: metadata.clone(),
                    labels: labels.clone(),
                });
                Ok(())
            })
            .await?;

        for hook in hooks {
            hook();
        }

        self.partition_queue.enqueue(PartitionEvent::FlowActivated {
            flow_id: flow_id.clone(),
        });
        self.try_start_ready_steps(flow_id).await;
        Ok(state)
    }

    /// Re-evaluate every `Pending` step in a flow, starting the ones whose
    /// inputs are now resolvable. Safe to call redundantly (each call is a
    /// no-op for a step that isn't `Pending` or isn't yet ready).
    pub async fn try_start_ready_steps(self: &Arc<Self>, flow_id: FlowId) {
        let flow = match self.executor.load_flow(&flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "failed to load flow while scanning for ready steps");
                return;
            }
        };
        if flow.status != FlowStatus::Active {
            return;
        }

        let pending: Vec<StepId> = flow
            .executions
            .iter()
            .filter(|(_, e)| e.status == StepStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for step_id in pending {
            let this = Arc::clone(self);
            let flow_id = flow_id.clone();
            tokio::spawn(async move {
                if let Err(err) = this.prepare_step(flow_id, step_id, HashSet::new()).await {
                    warn!(%err, "prepare_step failed");
                }
            });
        }
    }

    /// Attempt to move one step from `Pending` toward `Active`: wait for
    /// required inputs, race optional inputs against their fallback
    /// timeouts, then start work (or skip/memo-complete/vacuously complete).
    /// `force_expire` names optional attributes whose timeout has already
    /// fired and should now fall back to their default.
    pub async fn prepare_step(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        force_expire: HashSet<Name>,
    ) -> Result<(), EngineError> {
        let step_id_for_cmd = step_id.clone();
        let (_, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                self.prepare_step_cmd(current, tx, &step_id_for_cmd, &force_expire)
            })
            .await?;

        for hook in hooks {
            hook();
        }

        self.try_start_ready_steps(flow_id.clone()).await;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.check_terminal(flow_id).await {
                warn!(%err, "terminal check failed");
            }
        });
        Ok(())
    }

    fn prepare_step_cmd(
        self: &Arc<Self>,
        current: Option<&FlowState>,
        tx: &mut FlowTransaction,
        step_id: &StepId,
        force_expire: &HashSet<Name>,
    ) -> Result<(), EngineError> {
        let Some(flow) = current else {
            return Ok(());
        };
        let Some(exec) = flow.execution(step_id) else {
            return Ok(());
        };
        if exec.status != StepStatus::Pending {
            return Ok(());
        }
        let Some(step) = flow.plan.step(step_id) else {
            return Ok(());
        };

        match resolve(flow, step, force_expire) {
            Readiness::NotReady => Ok(()),
            Readiness::Waiting(waiting) => {
                self.arm_optional_timeouts(flow, exec, step_id, waiting, tx);
                Ok(())
            }
            Readiness::Ready(inputs) => self.begin_step_cmd(flow, step, inputs, tx),
        }
    }

    fn arm_optional_timeouts(
        self: &Arc<Self>,
        flow: &FlowState,
        exec: &ExecutionState,
        step_id: &StepId,
        waiting: Vec<(Name, std::time::Duration)>,
        tx: &mut FlowTransaction,
    ) {
        if exec.ready_at.is_none() {
            tx.emit(FlowEvent::StepReady {
                step_id: step_id.clone(),
            });
        }
        let ready_at = exec.ready_at.unwrap_or_else(|| self.clock.now());
        let flow_id = flow.id.clone();

        for (name, timeout) in waiting {
            let fire_at = ready_at + chrono::Duration::from_std(timeout).unwrap_or_default();
            let this = Arc::clone(self);
            let flow_id = flow_id.clone();
            let step_id = step_id.clone();
            let name = name.clone();
            tx.on_success(move || {
                let path = vec![
                    "timeout".to_string(),
                    flow_id.to_string(),
                    step_id.to_string(),
                    name.to_string(),
                ];
                let this2 = Arc::clone(&this);
                let flow_id2 = flow_id.clone();
                let step_id2 = step_id.clone();
                let name2 = name.clone();
                this.scheduler.schedule(
                    path,
                    fire_at,
                    Arc::new(move || {
                        let this3 = Arc::clone(&this2);
                        let flow_id3 = flow_id2.clone();
                        let step_id3 = step_id2.clone();
                        let name3 = name2.clone();
                        tokio::spawn(async move {
                            let mut forced = HashSet::new();
                            forced.insert(name3);
                            if let Err(err) = this3.prepare_step(flow_id3, step_id3, forced).await
                            {
                                warn!(%err, "optional-input timeout handling failed");
                            }
                        });
                        Ok(())
                    }),
                );
            });
        }
    }

    fn begin_step_cmd(
        self: &Arc<Self>,
        flow: &FlowState,
        step: &Step,
        inputs: Args,
        tx: &mut FlowTransaction,
    ) -> Result<(), EngineError> {
        let step_id = step.id.clone();

        if let Some(predicate) = &step.predicate {
            let arg_names: Vec<String> = inputs.keys().cloned().collect();
            let compiled = self
                .scripts
                .compile(&predicate.language, &predicate.source, &arg_names)
                .map_err(|e| EngineError::new(ErrorKind::InvalidStep, e.to_string()))?;
            let env = self
                .scripts
                .get(&predicate.language)
                .map_err(|e| EngineError::new(ErrorKind::InvalidStep, e.to_string()))?;
            let passed = env
                .evaluate_predicate(&compiled, &inputs)
                .map_err(|e| EngineError::new(ErrorKind::InvalidStep, e.to_string()))?;
            if !passed {
                tx.emit(FlowEvent::StepSkipped {
                    step_id: step_id.clone(),
                    reason: "predicate returned false".into(),
                });
                check_unreachable_cmd(flow, tx, std::slice::from_ref(&step_id));
                return Ok(());
            }
        }

        if step.memoizable {
            if let Some(cached) = self.memo.get(&step_id, &inputs) {
                tx.emit(FlowEvent::StepStarted {
                    step_id: step_id.clone(),
                    inputs,
                    work_items: vec![],
                });
                for (name, _) in step.outputs() {
                    if let Some(value) = cached.get(name.as_str()) {
                        tx.emit(FlowEvent::AttributeSet {
                            key: name.clone(),
                            value: value.clone(),
                            step_id: step_id.clone(),
                        });
                    }
                }
                tx.emit(FlowEvent::StepCompleted {
                    step_id,
                    outputs: cached,
                    duration_ms: 0,
                });
                return Ok(());
            }
        }

        let items: Vec<(Token, Args)> = match step.for_each_attribute() {
            Some(for_each_name) => match inputs.get(for_each_name.as_str()) {
                Some(Value::Array(elements)) => elements
                    .iter()
                    .map(|element| {
                        let mut item_inputs = inputs.clone();
                        item_inputs.insert(for_each_name.to_string(), element.clone());
                        (Token::generate(), item_inputs)
                    })
                    .collect(),
                _ => {
                    return Err(EngineError::new(
                        ErrorKind::InvalidStep,
                        format!("for_each attribute {for_each_name} is not an array"),
                    ));
                }
            },
            None => vec![(Token::generate(), inputs.clone())],
        };

        if items.is_empty() {
            tx.emit(FlowEvent::StepStarted {
                step_id: step_id.clone(),
                inputs,
                work_items: vec![],
            });
            let mut outputs = Args::new();
            for (name, _) in step.outputs() {
                outputs.insert(name.to_string(), Value::Array(vec![]));
                tx.emit(FlowEvent::AttributeSet {
                    key: name.clone(),
                    value: Value::Array(vec![]),
                    step_id: step_id.clone(),
                });
            }
            tx.emit(FlowEvent::StepCompleted {
                step_id,
                outputs,
                duration_ms: 0,
            });
            return Ok(());
        }

        tx.emit(FlowEvent::StepStarted {
            step_id: step_id.clone(),
            inputs,
            work_items: items.clone(),
        });

        let resolved_work = step.work.resolved_against(&self.config.default_work);
        let parallelism = resolved_work.parallelism.max(1) as usize;
        let flow_id = flow.id.clone();

        for (token, item_inputs) in items.into_iter().take(parallelism) {
            tx.emit(FlowEvent::WorkStarted {
                step_id: step_id.clone(),
                token: token.clone(),
            });
            let this = Arc::clone(self);
            let flow_id = flow_id.clone();
            let step_id = step_id.clone();
            tx.on_success(move || {
                let this = Arc::clone(&this);
                let flow_id = flow_id.clone();
                let step_id = step_id.clone();
                let token = token.clone();
                let item_inputs = item_inputs.clone();
                tokio::spawn(async move {
                    this.dispatch_work(flow_id, step_id, token, item_inputs).await;
                });
            });
        }

        Ok(())
    }

    async fn dispatch_work(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        inputs: Args,
    ) {
        let flow = match self.executor.load_flow(&flow_id).await {
            Ok(Some(flow)) => flow,
            _ => return,
        };
        let Some(step) = flow.plan.step(&step_id).cloned() else {
            return;
        };

        let result = if step.step_type == StepType::Script {
            self.execute_script_step(&step, &inputs)
        } else {
            let invocation = StepInvocation {
                flow_id: flow_id.clone(),
                step_id: step_id.clone(),
                token: token.clone(),
                receipt_token: Token::generate().to_string(),
                webhook_url: None,
            };
            match self.step_client.invoke(&step, &inputs, &invocation).await {
                StepOutcome::Success(outputs) => WorkResult::Succeeded(outputs),
                StepOutcome::Failure(err) => WorkResult::Failed(err),
                StepOutcome::NotCompleted(reason) => WorkResult::NotCompleted(reason),
            }
        };

        if let Err(err) = self
            .apply_work_result(flow_id, step_id, token, result)
            .await
        {
            warn!(%err, "failed to record work result");
        }
    }

    /// Runs a `Script`-typed step's work item directly through the registry
    /// instead of the external `StepClient`, the same compile-then-run path
    /// `begin_step_cmd` already uses for predicates.
    fn execute_script_step(self: &Arc<Self>, step: &Step, inputs: &Args) -> WorkResult {
        let Some(script) = &step.script else {
            return WorkResult::Failed("script step has no script spec".into());
        };
        let arg_names: Vec<String> = inputs.keys().cloned().collect();
        let compiled = match self
            .scripts
            .compile(&script.language, &script.source, &arg_names)
        {
            Ok(compiled) => compiled,
            Err(err) => return WorkResult::Failed(err.to_string()),
        };
        let env = match self.scripts.get(&script.language) {
            Ok(env) => env,
            Err(err) => return WorkResult::Failed(err.to_string()),
        };
        match env.execute_script(&compiled, inputs) {
            Ok(outputs) => WorkResult::Succeeded(outputs),
            Err(err) => WorkResult::Failed(err.to_string()),
        }
    }

    async fn apply_work_result(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        result: WorkResult,
    ) -> Result<(), EngineError> {
        let (_, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                self.apply_work_result_cmd(current, tx, &step_id, &token, &result)
            })
            .await?;

        for hook in hooks {
            hook();
        }

        self.try_start_ready_steps(flow_id.clone()).await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.check_terminal(flow_id).await {
                warn!(%err, "terminal check failed");
            }
        });
        Ok(())
    }

    fn apply_work_result_cmd(
        self: &Arc<Self>,
        current: Option<&FlowState>,
        tx: &mut FlowTransaction,
        step_id: &StepId,
        token: &Token,
        result: &WorkResult,
    ) -> Result<(), EngineError> {
        let Some(flow) = current else {
            return Ok(());
        };
        let Some(step) = flow.plan.step(step_id) else {
            return Ok(());
        };
        let Some(exec) = flow.execution(step_id) else {
            return Ok(());
        };
        let Some(work) = exec.work_items.get(token) else {
            return Ok(());
        };
        if work.status != WorkStatus::Active {
            // Already resolved (e.g. a duplicate webhook callback); ignore.
            return Ok(());
        }

        match result {
            WorkResult::Succeeded(outputs) => {
                tx.emit(FlowEvent::WorkSucceeded {
                    step_id: step_id.clone(),
                    token: token.clone(),
                    outputs: outputs.clone(),
                });
                self.finish_or_advance_step(
                    flow,
                    step,
                    exec,
                    tx,
                    step_id,
                    token,
                    Some(outputs.clone()),
                    false,
                );
            }
            // Permanent failure (`FailWork`): no retry, ever. Spec §4.3's
            // transition table has no Failed->Pending edge.
            WorkResult::Failed(err) => {
                tx.emit(FlowEvent::WorkFailed {
                    step_id: step_id.clone(),
                    token: token.clone(),
                    error: err.clone(),
                });
                self.finish_or_advance_step(flow, step, exec, tx, step_id, token, None, true);
            }
            // Transient non-completion (`NotCompleteWork`): retry-eligible.
            WorkResult::NotCompleted(err) => {
                tx.emit(FlowEvent::WorkNotCompleted {
                    step_id: step_id.clone(),
                    token: token.clone(),
                    error: err.clone(),
                });

                let resolved = step.work.resolved_against(&self.config.default_work);
                if should_retry(&resolved, work.retry_count) {
                    let next = calculate_next_retry(&resolved, work.retry_count, self.clock.now());
                    tx.emit(FlowEvent::RetryScheduled {
                        step_id: step_id.clone(),
                        token: token.clone(),
                        next,
                    });
                    let this = Arc::clone(self);
                    let flow_id = flow.id.clone();
                    let step_id = step_id.clone();
                    let token = token.clone();
                    tx.on_success(move || {
                        let this2 = Arc::clone(&this);
                        let flow_id2 = flow_id.clone();
                        let step_id2 = step_id.clone();
                        let token2 = token.clone();
                        this.scheduler.schedule(
                            vec![
                                "retry".to_string(),
                                flow_id.to_string(),
                                step_id.to_string(),
                                token.to_string(),
                            ],
                            next,
                            Arc::new(move || {
                                let this3 = Arc::clone(&this2);
                                let flow_id3 = flow_id2.clone();
                                let step_id3 = step_id2.clone();
                                let token3 = token2.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = this3
                                        .start_retry_work_item(flow_id3, step_id3, token3)
                                        .await
                                    {
                                        warn!(%err, "retry start failed");
                                    }
                                });
                                Ok(())
                            }),
                        );
                    });
                } else {
                    self.finish_or_advance_step(flow, step, exec, tx, step_id, token, None, true);
                }
            }
        }
        Ok(())
    }

    /// After one work item resolves, either keep the step's remaining items
    /// going (starting another `Pending` one to backfill parallelism), or —
    /// once nothing is left outstanding — finalize the step as Completed or
    /// Failed.
    fn finish_or_advance_step(
        self: &Arc<Self>,
        flow: &FlowState,
        step: &Step,
        exec: &ExecutionState,
        tx: &mut FlowTransaction,
        step_id: &StepId,
        token: &Token,
        succeeded_outputs: Option<Args>,
        permanently_failed: bool,
    ) {
        let outstanding = exec.work_items.values().any(|w| {
            w.token != *token
                && matches!(
                    w.status,
                    WorkStatus::Active | WorkStatus::Pending | WorkStatus::NotCompleted
                )
        });
        let any_failed = permanently_failed
            || exec
                .work_items
                .values()
                .any(|w| w.token != *token && w.status == WorkStatus::Failed);

        if outstanding {
            if !permanently_failed {
                if let Some(next) = exec.work_items.values().find(|w| w.status == WorkStatus::Pending) {
                    let next_token = next.token.clone();
                    let next_inputs = next.inputs.clone();
                    tx.emit(FlowEvent::WorkStarted {
                        step_id: step_id.clone(),
                        token: next_token.clone(),
                    });
                    let this = Arc::clone(self);
                    let flow_id = flow.id.clone();
                    let step_id = step_id.clone();
                    tx.on_success(move || {
                        let this = Arc::clone(&this);
                        let flow_id = flow_id.clone();
                        let step_id = step_id.clone();
                        let token = next_token.clone();
                        let inputs = next_inputs.clone();
                        tokio::spawn(async move {
                            this.dispatch_work(flow_id, step_id, token, inputs).await;
                        });
                    });
                }
            }
            return;
        }

        if any_failed {
            tx.emit(FlowEvent::StepFailed {
                step_id: step_id.clone(),
                reason: "one or more work items failed".into(),
            });
            return;
        }

        let outputs = succeeded_outputs.expect("finish path with no outstanding failure always has succeeded outputs");
        let mut items: Vec<(&Token, &Args, &Args)> = exec
            .work_items
            .iter()
            .filter(|(t, _)| **t != *token)
            .map(|(t, w)| {
                (
                    t,
                    &w.inputs,
                    w.outputs
                        .as_ref()
                        .expect("a resolved, non-failed work item always carries outputs"),
                )
            })
            .collect();
        let this_inputs = &exec
            .work_items
            .get(token)
            .expect("the just-resolved work item is still present")
            .inputs;
        items.push((token, this_inputs, &outputs));

        let aggregated = aggregate_outputs(step, &items);
        for (name, _) in step.outputs() {
            if let Some(value) = aggregated.get(name.as_str()) {
                tx.emit(FlowEvent::AttributeSet {
                    key: name.clone(),
                    value: value.clone(),
                    step_id: step_id.clone(),
                });
            }
        }

        let duration_ms = exec
            .started_at
            .map(|started| (self.clock.now() - started).num_milliseconds())
            .unwrap_or(0);
        tx.emit(FlowEvent::StepCompleted {
            step_id: step_id.clone(),
            outputs: aggregated.clone(),
            duration_ms,
        });

        if step.memoizable {
            if let Some(inputs) = &exec.inputs {
                self.memo.put(step_id, inputs, aggregated);
            }
        }
    }

    /// Restart a work item that a scheduled retry task fired for.
    async fn start_retry_work_item(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
    ) -> Result<(), EngineError> {
        let step_id_cmd = step_id.clone();
        let token_cmd = token.clone();
        let (_, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                let Some(flow) = current else {
                    return Ok(());
                };
                let Some(exec) = flow.execution(&step_id_cmd) else {
                    return Ok(());
                };
                let Some(work) = exec.work_items.get(&token_cmd) else {
                    return Ok(());
                };
                if work.status != WorkStatus::Pending {
                    return Ok(());
                }
                tx.emit(FlowEvent::WorkStarted {
                    step_id: step_id_cmd.clone(),
                    token: token_cmd.clone(),
                });
                Ok(())
            })
            .await?;

        for hook in hooks {
            hook();
        }

        if let Some(flow) = self.executor.load_flow(&flow_id).await? {
            if let Some(inputs) = flow
                .execution(&step_id)
                .and_then(|exec| exec.work_items.get(&token))
                .map(|work| work.inputs.clone())
            {
                let this = Arc::clone(self);
                let flow_id = flow_id.clone();
                let step_id = step_id.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    this.dispatch_work(flow_id, step_id, token, inputs).await;
                });
            }
        }
        Ok(())
    }

    /// Re-check whether the flow as a whole can now complete, fail, or
    /// whether a skip cascade unblocked further skips.
    pub async fn check_terminal(self: &Arc<Self>, flow_id: FlowId) -> Result<(), EngineError> {
        let (_, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                let Some(flow) = current else {
                    return Ok(());
                };
                if flow.status != FlowStatus::Active {
                    return Ok(());
                }

                let unreachable_changed = check_unreachable_cmd(flow, tx, &[]);
                let unused_changed = skip_pending_unused_cmd(flow, tx);
                if unreachable_changed || unused_changed {
                    let this = Arc::clone(self);
                    let flow_id = flow.id.clone();
                    tx.on_success(move || {
                        tokio::spawn(async move {
                            if let Err(err) = this.check_terminal(flow_id).await {
                                warn!(%err, "recursive terminal check failed");
                            }
                        });
                    });
                }

                if let Some((failed_id, exec)) =
                    flow.executions.iter().find(|(_, e)| e.status == StepStatus::Failed)
                {
                    tx.emit(FlowEvent::FlowFailed {
                        reason: format!(
                            "step {failed_id} failed: {}",
                            exec.error.clone().unwrap_or_default()
                        ),
                    });
                    enqueue_archiving_hook(self, flow, FlowStatus::Failed, tx);
                    return Ok(());
                }

                let all_goals_done = !flow.plan.goals.is_empty()
                    && flow.plan.goals.iter().all(|goal| {
                        flow.execution(goal)
                            .map(|e| matches!(e.status, StepStatus::Completed | StepStatus::Skipped))
                            .unwrap_or(false)
                    });
                if all_goals_done {
                    let mut result = Args::new();
                    for goal in &flow.plan.goals {
                        if let Some(outputs) = flow.execution(goal).and_then(|e| e.outputs.as_ref()) {
                            for (name, value) in outputs {
                                result.insert(format!("{goal}.{name}"), value.clone());
                            }
                        }
                    }
                    tx.emit(FlowEvent::FlowCompleted { result });
                    enqueue_archiving_hook(self, flow, FlowStatus::Completed, tx);
                }
                Ok(())
            })
            .await?;

        for hook in hooks {
            hook();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.maybe_deactivate(flow_id).await {
                warn!(%err, "deactivation check failed");
            }
        });
        Ok(())
    }

    /// Deactivate a terminal flow once every work item has drained, freeing
    /// its scheduler tasks and informing the partition index.
    pub async fn maybe_deactivate(self: &Arc<Self>, flow_id: FlowId) -> Result<(), EngineError> {
        let (_, hooks) = self
            .executor
            .exec_flow(&flow_id, move |current, tx| {
                let Some(flow) = current else {
                    return Ok(());
                };
                if flow.status.is_terminal() && !flow.deactivated && !flow.has_in_flight_work() {
                    tx.emit(FlowEvent::FlowDeactivated);
                    let this = Arc::clone(self);
                    let flow_id = flow.id.clone();
                    let parent = parent_link(&flow.metadata);
                    let status = flow.status;
                    let error = flow.error.clone();
                    let result = goal_result(flow);
                    tx.on_success(move || {
                        this.scheduler
                            .cancel_prefix(&["retry".to_string(), flow_id.to_string()]);
                        this.scheduler
                            .cancel_prefix(&["timeout".to_string(), flow_id.to_string()]);
                        this.partition_queue
                            .enqueue(PartitionEvent::FlowDeactivated { flow_id: flow_id.clone() });

                        if let Some((parent_flow_id, parent_step_id, parent_token)) = parent {
                            let this = Arc::clone(&this);
                            tokio::spawn(async move {
                                let outcome = match status {
                                    FlowStatus::Completed => {
                                        this.complete_work(parent_flow_id, parent_step_id, parent_token, result)
                                            .await
                                    }
                                    _ => {
                                        this.fail_work(
                                            parent_flow_id,
                                            parent_step_id,
                                            parent_token,
                                            error.unwrap_or_else(|| "child flow did not complete".to_string()),
                                        )
                                        .await
                                    }
                                };
                                if let Err(err) = outcome {
                                    warn!(%err, "failed to report child flow outcome to parent work item");
                                }
                            });
                        }
                    });
                }
                Ok(())
            })
            .await?;

        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Re-arm a pending retry's scheduler task after a restart. Idempotent:
    /// scheduling under the same path replaces any earlier arm.
    pub(crate) fn rearm_retry(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        let this = Arc::clone(self);
        self.scheduler.schedule(
            vec![
                "retry".to_string(),
                flow_id.to_string(),
                step_id.to_string(),
                token.to_string(),
            ],
            at,
            Arc::new(move || {
                let this = Arc::clone(&this);
                let flow_id = flow_id.clone();
                let step_id = step_id.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.start_retry_work_item(flow_id, step_id, token).await {
                        warn!(%err, "retry start failed");
                    }
                });
                Ok(())
            }),
        );
    }

    /// Re-dispatch a work item a crash left `Active`/`NotCompleted`, without
    /// re-emitting `WorkStarted` (it already fired before the crash).
    pub(crate) fn redispatch(self: &Arc<Self>, flow_id: FlowId, step_id: StepId, token: Token, inputs: Args) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_work(flow_id, step_id, token, inputs).await;
        });
    }

    /// Tell the partition index this flow is active. Used when recovery
    /// finds a flow the store knows about but the partition aggregate
    /// doesn't yet (the original activation hook never landed before a
    /// crash).
    pub(crate) fn activate_on_recovery(&self, flow_id: FlowId) {
        self.partition_queue
            .enqueue(PartitionEvent::FlowActivated { flow_id });
    }

    /// Record a successful result for a work item, reported either by
    /// `dispatch_work`'s own invocation or by an external executor's
    /// out-of-band callback (spec §6, `CompleteWork`).
    pub async fn complete_work(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        outputs: Args,
    ) -> Result<(), EngineError> {
        self.apply_work_result(flow_id, step_id, token, WorkResult::Succeeded(outputs))
            .await
    }

    /// Record a permanent failure for a work item (spec §6, `FailWork`).
    pub async fn fail_work(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        error: String,
    ) -> Result<(), EngineError> {
        self.apply_work_result(flow_id, step_id, token, WorkResult::Failed(error))
            .await
    }

    /// Record that a work item did not complete and should be retried if
    /// policy allows (spec §6, `NotCompleteWork`).
    pub async fn not_complete_work(
        self: &Arc<Self>,
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        error: String,
    ) -> Result<(), EngineError> {
        self.apply_work_result(flow_id, step_id, token, WorkResult::NotCompleted(error))
            .await
    }
}

/// Schedules the partition-queue side effects that follow a flow reaching a
/// terminal status: mark it archiving and publish its digest.
fn enqueue_archiving_hook<S: EventStore + 'static>(
    orchestrator: &Arc<FlowOrchestrator<S>>,
    flow: &FlowState,
    status: FlowStatus,
    tx: &mut FlowTransaction,
) {
    let this = Arc::clone(orchestrator);
    let flow_id = flow.id.clone();
    let digest = flow_digest(flow, status);
    tx.on_success(move || {
        this.partition_queue.enqueue(PartitionEvent::FlowArchiving {
            flow_id: flow_id.clone(),
        });
        this.partition_queue
            .enqueue(PartitionEvent::FlowDigestUpdated { flow_id, digest });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::EngineConfig;
    use crate::event_queue::EventQueueConfig;
    use crate::executor::ExecutorConfig;
    use crate::model::{
        AttributeEdge, AttributeRole, AttributeSpec, AttributeType, ExcludedAttributes, StepType,
        WorkConfig,
    };
    use crate::store::memory::InMemoryEventStore;
    use crate::work_executor::MockStepClient;
    use serde_json::json;
    use std::collections::HashMap;

    fn make_step(id: &str, attrs: Vec<(&str, AttributeSpec)>) -> Step {
        Step {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: StepType::Sync,
            attributes: attrs.into_iter().map(|(n, s)| (Name::new(n), s)).collect(),
            http: None,
            script: None,
            predicate: None,
            flow: None,
            work: WorkConfig {
                max_retries: 0,
                ..WorkConfig::default()
            },
            memoizable: false,
        }
    }

    fn linear_plan() -> ExecutionPlan {
        let producer = make_step(
            "producer",
            vec![("value", AttributeSpec::output(AttributeType::String))],
        );
        let consumer = make_step(
            "consumer",
            vec![
                ("value", AttributeSpec::required(AttributeType::String)),
                ("result", AttributeSpec::output(AttributeType::String)),
            ],
        );
        let mut steps = HashMap::new();
        steps.insert(producer.id.clone(), producer);
        steps.insert(consumer.id.clone(), consumer);

        let mut attributes = HashMap::new();
        attributes.insert(
            Name::new("value"),
            AttributeEdge {
                providers: vec![StepId::new("producer")],
                consumers: vec![StepId::new("consumer")],
            },
        );

        ExecutionPlan {
            goals: vec![StepId::new("consumer")],
            steps,
            attributes,
            required: vec![],
            excluded: ExcludedAttributes::default(),
        }
    }

    fn build_orchestrator(
        step_client: Arc<dyn StepClient>,
    ) -> (Arc<FlowOrchestrator<InMemoryEventStore>>, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let store = Arc::new(InMemoryEventStore::new());
        let executor = Arc::new(Executor::new(store, ExecutorConfig::default()));
        let scheduler = Arc::new(TaskScheduler::new(clock.clone() as Arc<dyn Clock>));
        let scripts = Arc::new(ScriptRegistry::new(16));
        let memo = Arc::new(MemoCache::new(16));
        let queue = Arc::new(EventQueue::new(EventQueueConfig::default()));
        let orchestrator = Arc::new(FlowOrchestrator::new(
            executor,
            scheduler,
            clock.clone() as Arc<dyn Clock>,
            scripts,
            memo,
            step_client,
            queue,
            EngineConfig::default(),
        ));
        (orchestrator, clock)
    }

    #[tokio::test]
    async fn linear_chain_runs_producer_then_consumer_to_completion() {
        let step_client = Arc::new(
            MockStepClient::new()
                .on("producer", |_inputs| {
                    let mut out = Args::new();
                    out.insert("value".to_string(), json!("hi"));
                    StepOutcome::Success(out)
                })
                .on("consumer", |inputs| {
                    let mut out = Args::new();
                    out.insert("result".to_string(), inputs["value"].clone());
                    StepOutcome::Success(out)
                }),
        );
        let (orchestrator, _clock) = build_orchestrator(step_client);

        let flow_id = FlowId::new("f-linear");
        orchestrator
            .start_flow(flow_id.clone(), linear_plan(), Args::new(), HashMap::new(), HashMap::new())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let flow = orchestrator
            .executor()
            .load_flow(&flow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(
            flow.attributes[&Name::new("result")].value,
            json!("hi")
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_flow() {
        let step = make_step(
            "only",
            vec![("out", AttributeSpec::output(AttributeType::String))],
        );
        let mut steps = HashMap::new();
        steps.insert(step.id.clone(), step);
        let plan = ExecutionPlan {
            goals: vec![StepId::new("only")],
            steps,
            attributes: HashMap::new(),
            required: vec![],
            excluded: ExcludedAttributes::default(),
        };

        let step_client = Arc::new(
            MockStepClient::new().on("only", |_inputs| StepOutcome::Failure("boom".into())),
        );
        let (orchestrator, _clock) = build_orchestrator(step_client);
        let flow_id = FlowId::new("f-fail");
        orchestrator
            .start_flow(flow_id.clone(), plan, Args::new(), HashMap::new(), HashMap::new())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let flow = orchestrator
            .executor()
            .load_flow(&flow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn optional_input_falls_back_to_default_without_a_timeout() {
        let step = make_step(
            "only",
            vec![
                ("greeting", AttributeSpec::optional(AttributeType::String, "\"hello\"")),
                ("out", AttributeSpec::output(AttributeType::String)),
            ],
        );
        let mut steps = HashMap::new();
        steps.insert(step.id.clone(), step);
        let plan = ExecutionPlan {
            goals: vec![StepId::new("only")],
            steps,
            attributes: HashMap::new(),
            required: vec![],
            excluded: ExcludedAttributes::default(),
        };

        let step_client = Arc::new(MockStepClient::new().on("only", |inputs| {
            let mut out = Args::new();
            out.insert("out".to_string(), inputs["greeting"].clone());
            StepOutcome::Success(out)
        }));
        let (orchestrator, _clock) = build_orchestrator(step_client);
        let flow_id = FlowId::new("f-optional");
        orchestrator
            .start_flow(flow_id.clone(), plan, Args::new(), HashMap::new(), HashMap::new())
            .await
            .unwrap();

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let flow = orchestrator
            .executor()
            .load_flow(&flow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.attributes[&Name::new("out")].value, json!("hello"));
    }
}
