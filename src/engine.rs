//! The public engine facade (spec §6): wires the executor, scheduler, event
//! queue, script/memo caches and orchestrator into the single entry point a
//! host process embeds. Lifecycle (`start`/`stop`) follows the same
//! watch-channel-shutdown, tracked-join-handle shape the teacher's worker
//! pool uses.

use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::event_queue::{EventQueue, PartitionEventHandler};
use crate::events::PartitionEvent;
use crate::executor::Executor;
use crate::memo::MemoCache;
use crate::model::{
    Args, FlowId, FlowState, FlowStatus, HealthStatus, Labels, Metadata, Name, StepId,
};
use crate::orchestrator::{
    FlowOrchestrator, PARENT_FLOW_ID_KEY, PARENT_STEP_ID_KEY, PARENT_WORK_ITEM_TOKEN_KEY,
};
use crate::planner;
use crate::recovery::{self, RecoveryReport};
use crate::scheduler::TaskScheduler;
use crate::script::ScriptRegistry;
use crate::store::EventStore;
use crate::work_executor::StepClient;

/// Options a caller supplies to `Engine::start_flow`, built up with the
/// `with_*` builders (spec §6, "Flow options").
#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    init: Args,
    metadata: Metadata,
    labels: Labels,
}

impl FlowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init(mut self, init: Args) -> Self {
        self.init = init;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// A child flow must name its whole parent reference or none of it —
    /// partial linkage would leave `maybeDeactivate` unable to complete the
    /// parent's work item on this flow's behalf.
    fn validate(&self) -> Result<(), EngineError> {
        let present = [
            self.metadata.contains_key(PARENT_FLOW_ID_KEY),
            self.metadata.contains_key(PARENT_STEP_ID_KEY),
            self.metadata.contains_key(PARENT_WORK_ITEM_TOKEN_KEY),
        ];
        if present.iter().any(|p| *p) && !present.iter().all(|p| *p) {
            return Err(EngineError::new(
                ErrorKind::InvalidStep,
                "parent_flow_id, parent_step_id and parent_work_item_token must be set together",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    CreatedAtAsc,
    CreatedAtDesc,
}

/// A `QueryFlows` request: every field narrows the result set, applied in
/// the order filter -> sort -> cursor -> limit.
#[derive(Debug, Clone, Default)]
pub struct QueryFlowsRequest {
    pub id_prefix: Option<String>,
    pub statuses: Vec<FlowStatus>,
    pub labels: Labels,
    pub sort: SortOrder,
    pub limit: usize,
    pub cursor: Option<String>,
}

/// One page of a `QueryFlows` result. `next_cursor` is `None` once the last
/// page has been returned.
#[derive(Debug, Clone, Default)]
pub struct QueryFlowsPage {
    pub flows: Vec<FlowState>,
    pub next_cursor: Option<String>,
}

fn encode_cursor(flow_id: &FlowId, created_at: DateTime<Utc>) -> String {
    let raw = format!("{}|{}", flow_id.as_str(), created_at.timestamp_millis());
    base64::engine::general_purpose::STANDARD.encode(raw)
}

fn decode_cursor(cursor: &str) -> Result<(String, i64), EngineError> {
    let invalid = || EngineError::new(ErrorKind::InvalidFlowCursor, "malformed flow cursor");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(cursor)
        .map_err(|_| invalid())?;
    let text = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (id, millis) = text.rsplit_once('|').ok_or_else(invalid)?;
    let millis: i64 = millis.parse().map_err(|_| invalid())?;
    Ok((id.to_string(), millis))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineStatus {
    Stopped,
    Running,
}

/// Re-emits partition events onto the partition aggregate via its own
/// transaction. The event queue only ever carries events that were already
/// decided inside a flow command; this handler's job is purely durability.
struct PartitionCommandHandler<S: EventStore> {
    executor: Arc<Executor<S>>,
}

#[async_trait]
impl<S: EventStore + 'static> PartitionEventHandler for PartitionCommandHandler<S> {
    async fn handle(&self, events: &[PartitionEvent]) -> Result<(), anyhow::Error> {
        let events = events.to_vec();
        self.executor
            .exec_partition(move |_current, tx| {
                for event in &events {
                    tx.emit(event.clone());
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// The flow execution engine: the single object a host process constructs,
/// starts, and drives the whole orchestration kernel through.
pub struct Engine<S: EventStore> {
    executor: Arc<Executor<S>>,
    scheduler: Arc<TaskScheduler>,
    clock: Arc<dyn Clock>,
    partition_queue: Arc<EventQueue>,
    orchestrator: Arc<FlowOrchestrator<S>>,
    scripts: Arc<ScriptRegistry>,
    config: EngineConfig,
    status: RwLock<EngineStatus>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    scheduler_handle: StdMutex<Option<JoinHandle<()>>>,
    queue_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: EventStore + 'static> Engine<S> {
    pub fn new(store: S, step_client: Arc<dyn StepClient>, config: EngineConfig) -> Self {
        Self::with_clock(store, step_client, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: S,
        step_client: Arc<dyn StepClient>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(store);
        let executor = Arc::new(Executor::new(store, config.executor.clone()));
        let scheduler = Arc::new(TaskScheduler::new(clock.clone()));
        let scripts = Arc::new(ScriptRegistry::new(config.script_cache_capacity));
        let memo = Arc::new(MemoCache::new(config.memo_cache_capacity));
        let partition_queue = Arc::new(EventQueue::new(config.event_queue.clone()));

        let orchestrator = Arc::new(FlowOrchestrator::new(
            Arc::clone(&executor),
            Arc::clone(&scheduler),
            clock.clone(),
            Arc::clone(&scripts),
            memo,
            step_client,
            Arc::clone(&partition_queue),
            config.clone(),
        ));

        Self {
            executor,
            scheduler,
            clock,
            partition_queue,
            orchestrator,
            scripts,
            config,
            status: RwLock::new(EngineStatus::Stopped),
            shutdown: StdMutex::new(None),
            scheduler_handle: StdMutex::new(None),
            queue_handle: StdMutex::new(None),
        }
    }

    /// Start the scheduler worker and event-queue worker, then recover every
    /// in-flight flow from the event log (spec §4.10). Idempotent: calling
    /// `start` while already running is a no-op.
    pub async fn start(&self) -> Result<RecoveryReport, EngineError> {
        {
            let mut status = self.status.write().unwrap();
            if *status == EngineStatus::Running {
                return Ok(RecoveryReport::default());
            }
            *status = EngineStatus::Running;
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_rx = rx.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(scheduler_rx).await;
        });
        *self.scheduler_handle.lock().unwrap() = Some(scheduler_handle);

        let queue = Arc::clone(&self.partition_queue);
        let handler: Arc<dyn PartitionEventHandler> = Arc::new(PartitionCommandHandler {
            executor: Arc::clone(&self.executor),
        });
        let queue_handle = tokio::spawn(async move {
            queue.run(handler).await;
        });
        *self.queue_handle.lock().unwrap() = Some(queue_handle);

        self.recover_flows().await
    }

    /// Stop the scheduler and event-queue workers. The scheduler worker
    /// drains via its shutdown channel and is awaited to completion; the
    /// event queue has no equivalent signal (it only exits once every sender
    /// handle is dropped, and the engine keeps one alive across restarts)
    /// so its worker is aborted instead. Any in-flight external step call
    /// loses its outcome — the retry path picks the work item back up on
    /// the next `start`.
    pub async fn stop(&self) -> Result<(), EngineError> {
        {
            let mut status = self.status.write().unwrap();
            if *status == EngineStatus::Stopped {
                return Ok(());
            }
            *status = EngineStatus::Stopped;
        }

        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }

        let scheduler_handle = self.scheduler_handle.lock().unwrap().take();
        if let Some(handle) = scheduler_handle {
            let _ = handle.await;
        }

        let queue_handle = self.queue_handle.lock().unwrap().take();
        if let Some(handle) = queue_handle {
            handle.abort();
        }

        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn register_step(&self, step: crate::model::Step) -> Result<(), EngineError> {
        validate_script_support(&step, &self.scripts)?;
        let step_id = step.id.clone();
        self.executor
            .exec_catalog(move |current, tx| {
                if current.steps.contains_key(&step_id) {
                    return Err(EngineError::new(
                        ErrorKind::StepExists,
                        format!("step {step_id} already registered"),
                    ));
                }
                current.validate_registration(&step)?;
                bind_new_attribute_types(current, &step, tx);
                tx.emit(crate::events::CatalogEvent::StepRegistered {
                    step: Box::new(step.clone()),
                });
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_step(&self, step: crate::model::Step) -> Result<(), EngineError> {
        validate_script_support(&step, &self.scripts)?;
        let step_id = step.id.clone();
        self.executor
            .exec_catalog(move |current, tx| {
                if !current.steps.contains_key(&step_id) {
                    return Err(EngineError::step_not_found(step_id.clone()));
                }
                current.validate_registration(&step)?;
                bind_new_attribute_types(current, &step, tx);
                tx.emit(crate::events::CatalogEvent::StepUpdated {
                    step: Box::new(step.clone()),
                });
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn unregister_step(&self, step_id: StepId) -> Result<(), EngineError> {
        self.executor
            .exec_catalog(move |current, tx| {
                if !current.steps.contains_key(&step_id) {
                    return Err(EngineError::step_not_found(step_id.clone()));
                }
                tx.emit(crate::events::CatalogEvent::StepUnregistered {
                    step_id: step_id.clone(),
                });
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_step_health(
        &self,
        step_id: StepId,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        self.executor
            .exec_catalog(move |current, tx| {
                if !current.steps.contains_key(&step_id) {
                    return Err(EngineError::step_not_found(step_id.clone()));
                }
                tx.emit(crate::events::CatalogEvent::StepHealthUpdated {
                    step_id: step_id.clone(),
                    health: crate::model::HealthState {
                        status,
                        error: error.clone(),
                    },
                });
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Derive an execution plan for `goals` against the current catalog and
    /// start a new flow from it. `flow_id` must be unique; reusing one that
    /// is already started returns `ErrorKind::FlowExists`.
    pub async fn start_flow(
        &self,
        flow_id: FlowId,
        goals: Vec<StepId>,
        options: FlowOptions,
    ) -> Result<FlowState, EngineError> {
        options.validate()?;

        let catalog = self.executor.load_catalog().await?;
        let init_keys: std::collections::HashSet<Name> =
            options.init.keys().map(|k| Name::new(k.clone())).collect();
        let plan = planner::plan(&catalog, &goals, &init_keys)?;

        let missing: Vec<&Name> = plan
            .required
            .iter()
            .filter(|name| !options.init.contains_key(name.as_str()))
            .collect();
        if !missing.is_empty() {
            let names = missing
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::new(
                ErrorKind::InvalidStep,
                format!("flow init is missing required attribute(s): {names}"),
            ));
        }

        self.orchestrator
            .start_flow(flow_id, plan, options.init, options.metadata, options.labels)
            .await
    }

    pub async fn get_flow_state(&self, flow_id: &FlowId) -> Result<Option<FlowState>, EngineError> {
        Ok(self.executor.load_flow(flow_id).await?)
    }

    /// Every flow known to the store, unfiltered and unsorted. `QueryFlows`
    /// is the filtered/paginated counterpart.
    pub async fn list_flows(&self) -> Result<Vec<FlowState>, EngineError> {
        let ids = self.executor.store().list_aggregates(&["flow".to_string()]).await?;
        let mut flows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(flow_id) = id.0.get(1).cloned() else {
                continue;
            };
            if let Some(flow) = self.executor.load_flow(&FlowId::new(flow_id)).await? {
                flows.push(flow);
            }
        }
        Ok(flows)
    }

    pub async fn query_flows(&self, request: QueryFlowsRequest) -> Result<QueryFlowsPage, EngineError> {
        let mut flows = self.list_flows().await?;

        if let Some(prefix) = &request.id_prefix {
            flows.retain(|f| f.id.as_str().starts_with(prefix.as_str()));
        }
        if !request.statuses.is_empty() {
            flows.retain(|f| request.statuses.contains(&f.status));
        }
        for (key, value) in &request.labels {
            flows.retain(|f| f.labels.get(key) == Some(value));
        }

        match request.sort {
            SortOrder::CreatedAtAsc => {
                flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            }
            SortOrder::CreatedAtDesc => {
                flows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)))
            }
        }

        if let Some(cursor) = &request.cursor {
            let (after_id, after_millis) = decode_cursor(cursor)?;
            flows.retain(|f| {
                let millis = f.created_at.timestamp_millis();
                let key = (millis, f.id.as_str());
                let after = (after_millis, after_id.as_str());
                match request.sort {
                    SortOrder::CreatedAtAsc => key > after,
                    SortOrder::CreatedAtDesc => key < after,
                }
            });
        }

        let limit = if request.limit == 0 { flows.len() } else { request.limit };
        let next_cursor = if flows.len() > limit {
            let boundary = &flows[limit - 1];
            Some(encode_cursor(&boundary.id, boundary.created_at))
        } else {
            None
        };
        flows.truncate(limit);

        Ok(QueryFlowsPage { flows, next_cursor })
    }

    pub async fn recover_flow(&self, flow_id: FlowId) -> Result<(), EngineError> {
        recovery::recover_flow(&self.orchestrator, flow_id).await
    }

    pub async fn recover_flows(&self) -> Result<RecoveryReport, EngineError> {
        let report = recovery::recover_flows(&self.orchestrator, self.config.recovery_concurrency).await?;
        info!(?report, "engine recovery complete");
        Ok(report)
    }

    /// Report a successful work-item outcome (spec §6, `CompleteWork`). The
    /// external executor supplies the same token it was invoked with.
    pub async fn complete_work(
        &self,
        flow_id: FlowId,
        step_id: StepId,
        token: crate::model::Token,
        outputs: Args,
    ) -> Result<(), EngineError> {
        self.orchestrator
            .complete_work(flow_id, step_id, token, outputs)
            .await
    }

    /// Report a permanent work-item failure (spec §6, `FailWork`).
    pub async fn fail_work(
        &self,
        flow_id: FlowId,
        step_id: StepId,
        token: crate::model::Token,
        error: String,
    ) -> Result<(), EngineError> {
        self.orchestrator.fail_work(flow_id, step_id, token, error).await
    }

    /// Report that a work item did not complete and should be retried if
    /// policy allows (spec §6, `NotCompleteWork`).
    pub async fn not_complete_work(
        &self,
        flow_id: FlowId,
        step_id: StepId,
        token: crate::model::Token,
        error: String,
    ) -> Result<(), EngineError> {
        self.orchestrator
            .not_complete_work(flow_id, step_id, token, error)
            .await
    }
}

/// Emit `AttributeTypeBound` for every attribute name `step` introduces that
/// the catalog hasn't already bound a type to. `validate_registration` only
/// checks for conflicts; binding the type is this command's job.
/// Reject a `Script`-typed step whose declared language's environment has
/// opted out of script steps (spec §3 invariant iii). Done here rather than
/// in `validate_registration` since that is a pure aggregate-state function
/// with no `ScriptRegistry` access.
fn validate_script_support(
    step: &crate::model::Step,
    scripts: &ScriptRegistry,
) -> Result<(), EngineError> {
    if step.step_type != crate::model::StepType::Script {
        return Ok(());
    }
    let Some(script) = &step.script else {
        return Err(EngineError::new(
            ErrorKind::InvalidStep,
            format!("step {} is Script-typed but declares no script", step.id),
        ));
    };
    let env = scripts
        .get(&script.language)
        .map_err(|e| EngineError::new(ErrorKind::UnsupportedLanguage, e.to_string()))?;
    if !env.supports_script_steps() {
        return Err(EngineError::new(
            ErrorKind::UnsupportedLanguage,
            format!("language {} does not support script steps", script.language),
        ));
    }
    Ok(())
}

fn bind_new_attribute_types(
    current: &crate::aggregate::CatalogState,
    step: &crate::model::Step,
    tx: &mut crate::executor::CatalogTransaction,
) {
    for (name, spec) in &step.attributes {
        if !current.attribute_types.contains_key(name) {
            tx.emit(crate::events::CatalogEvent::AttributeTypeBound {
                name: name.clone(),
                attr_type: spec.attr_type,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeSpec, AttributeType, Step, StepType, WorkConfig};
    use crate::store::memory::InMemoryEventStore;
    use crate::work_executor::{MockStepClient, StepOutcome};

    fn producer_step() -> Step {
        Step {
            id: StepId::new("producer"),
            name: "producer".to_string(),
            step_type: StepType::Sync,
            attributes: [(Name::new("out"), AttributeSpec::output(AttributeType::String))]
                .into_iter()
                .collect(),
            http: None,
            script: None,
            predicate: None,
            flow: None,
            work: WorkConfig::default(),
            memoizable: false,
        }
    }

    fn engine() -> Engine<InMemoryEventStore> {
        let step_client: Arc<dyn StepClient> = Arc::new(MockStepClient::new().on("producer", |_inputs| {
            let mut out = Args::new();
            out.insert("out".to_string(), serde_json::json!("done"));
            StepOutcome::Success(out)
        }));
        Engine::new(InMemoryEventStore::new(), step_client, EngineConfig::default())
    }

    #[tokio::test]
    async fn register_then_start_flow_runs_to_completion() {
        let engine = engine();
        engine.register_step(producer_step()).await.unwrap();
        engine.start().await.unwrap();

        let flow = engine
            .start_flow(
                FlowId::new("f-1"),
                vec![StepId::new("producer")],
                FlowOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(flow.status, FlowStatus::Active);

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let state = engine.get_flow_state(&FlowId::new("f-1")).await.unwrap().unwrap();
        assert_eq!(state.status, FlowStatus::Completed);

        engine.stop().await.unwrap();
    }

    fn script_step(language: &str) -> Step {
        Step {
            id: StepId::new("scripted"),
            name: "scripted".to_string(),
            step_type: StepType::Script,
            attributes: [(Name::new("value"), AttributeSpec::output(AttributeType::Any))]
                .into_iter()
                .collect(),
            http: None,
            script: Some(crate::model::ScriptSpec {
                language: language.to_string(),
                source: "$x".to_string(),
            }),
            predicate: None,
            flow: None,
            work: WorkConfig::default(),
            memoizable: false,
        }
    }

    #[test]
    fn script_step_with_registered_language_is_accepted() {
        let scripts = ScriptRegistry::new(16);
        assert!(validate_script_support(&script_step("native"), &scripts).is_ok());
    }

    #[test]
    fn script_step_with_unregistered_language_is_rejected() {
        let scripts = ScriptRegistry::new(16);
        let err = validate_script_support(&script_step("lua"), &scripts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedLanguage);
    }

    struct PredicateOnlyEnvironment;

    impl crate::script::ScriptEnvironment for PredicateOnlyEnvironment {
        fn validate(&self, _source: &str) -> Result<(), crate::script::ScriptError> {
            Ok(())
        }
        fn compile(
            &self,
            _source: &str,
            _arg_names: &[String],
        ) -> Result<crate::script::Compiled, crate::script::ScriptError> {
            Ok(crate::script::Compiled::new(()))
        }
        fn execute_script(
            &self,
            _compiled: &crate::script::Compiled,
            _inputs: &Args,
        ) -> Result<Args, crate::script::ScriptError> {
            Ok(Args::new())
        }
        fn evaluate_predicate(
            &self,
            _compiled: &crate::script::Compiled,
            _inputs: &Args,
        ) -> Result<bool, crate::script::ScriptError> {
            Ok(true)
        }
        fn supports_script_steps(&self) -> bool {
            false
        }
    }

    #[test]
    fn script_step_using_a_predicate_only_language_is_rejected() {
        let mut scripts = ScriptRegistry::new(16);
        scripts.register("jpath", Arc::new(PredicateOnlyEnvironment));
        let err = validate_script_support(&script_step("jpath"), &scripts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedLanguage);
    }

    #[tokio::test]
    async fn registering_the_same_step_twice_is_rejected() {
        let engine = engine();
        engine.register_step(producer_step()).await.unwrap();
        let err = engine.register_step(producer_step()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepExists);
    }

    #[tokio::test]
    async fn start_flow_rejects_missing_required_init() {
        let engine = engine();
        let mut consumer = producer_step();
        consumer.id = StepId::new("consumer");
        consumer.name = "consumer".to_string();
        consumer.attributes = [
            (Name::new("needed"), AttributeSpec::required(AttributeType::String)),
            (Name::new("consumer_out"), AttributeSpec::output(AttributeType::String)),
        ]
        .into_iter()
        .collect();

        engine.register_step(consumer).await.unwrap();

        let err = engine
            .start_flow(FlowId::new("f-2"), vec![StepId::new("consumer")], FlowOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidStep);
    }

    #[tokio::test]
    async fn parent_metadata_requires_all_three_keys() {
        let mut metadata = Metadata::new();
        metadata.insert(PARENT_FLOW_ID_KEY.to_string(), serde_json::json!("parent-1"));
        let options = FlowOptions::new().with_metadata(metadata);
        let err = options.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidStep);
    }

    #[tokio::test]
    async fn query_flows_paginates_by_cursor() {
        let engine = engine();
        engine.register_step(producer_step()).await.unwrap();
        engine.start().await.unwrap();

        for i in 0..3 {
            engine
                .start_flow(
                    FlowId::new(format!("f-{i}")),
                    vec![StepId::new("producer")],
                    FlowOptions::new(),
                )
                .await
                .unwrap();
        }

        let first = engine
            .query_flows(QueryFlowsRequest {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.flows.len(), 2);
        assert!(first.next_cursor.is_some());

        let second = engine
            .query_flows(QueryFlowsRequest {
                limit: 2,
                cursor: first.next_cursor,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.flows.len(), 1);
        assert!(second.next_cursor.is_none());

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_cursor_is_rejected() {
        let engine = engine();
        let err = engine
            .query_flows(QueryFlowsRequest {
                cursor: Some("not-a-cursor".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFlowCursor);
    }
}
