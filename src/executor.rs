//! The executor: runs one command against an aggregate under optimistic
//! concurrency and fires its after-commit hooks once the batch is durable
//! (spec §4.1).

use std::sync::Arc;
use thiserror::Error;

use crate::aggregate::{self, CatalogState, PartitionState};
use crate::error::EngineError;
use crate::events::{CatalogEvent, FlowEvent, PartitionEvent};
use crate::model::{FlowId, FlowState};
use crate::store::{AggregateId, EventStore, StoreError};

/// An after-commit hook: runs once the event batch is durable. Hooks must
/// never mutate an aggregate directly — they dispatch work, schedule tasks,
/// or enqueue partition events, each through its own fresh transaction.
pub type Hook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("command rejected: {0}")]
    Command(#[from] EngineError),

    #[error("aggregate accumulated too many events ({0}); consider snapshotting")]
    TooManyEvents(usize),

    #[error("transaction conflicted after {0} retries")]
    ConflictExhausted(u32),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_events_per_aggregate: usize,
    pub max_conflict_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_aggregate: 100_000,
            max_conflict_retries: 5,
        }
    }
}

/// Accumulates the events one command wants to append, plus the hooks that
/// should run once they are durable.
pub struct Transaction<Ev> {
    events: Vec<Ev>,
    hooks: Vec<Hook>,
}

impl<Ev> Transaction<Ev> {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: Ev) {
        self.events.push(event);
    }

    pub fn on_success<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.hooks.push(Box::new(f));
    }
}

pub type FlowTransaction = Transaction<FlowEvent>;
pub type CatalogTransaction = Transaction<CatalogEvent>;
pub type PartitionTransaction = Transaction<PartitionEvent>;

pub struct Executor<S: EventStore> {
    store: Arc<S>,
    config: ExecutorConfig,
}

impl<S: EventStore> Executor<S> {
    pub fn new(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read a flow's current state without appending anything. Returns
    /// `None` if the flow has never been started.
    pub async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<FlowState>, ExecutorError> {
        let id = AggregateId::flow(flow_id);
        let stored = self.store.get_events(&id, 0).await?;
        let decoded = aggregate::decode_events::<FlowEvent>(&stored)?;
        Ok(aggregate::flow::fold(&decoded, flow_id))
    }

    /// Run `cmd` against the flow aggregate `flow_id`, retrying on
    /// optimistic-concurrency conflicts. Returns the post-commit state and
    /// the hooks the caller must now invoke.
    pub async fn exec_flow<F>(
        &self,
        flow_id: &FlowId,
        cmd: F,
    ) -> Result<(FlowState, Vec<Hook>), ExecutorError>
    where
        F: Fn(Option<&FlowState>, &mut FlowTransaction) -> Result<(), EngineError>,
    {
        let id = AggregateId::flow(flow_id);
        let mut attempt = 0;
        loop {
            let stored = self.store.get_events(&id, 0).await?;
            if stored.len() >= self.config.max_events_per_aggregate {
                return Err(ExecutorError::TooManyEvents(stored.len()));
            }
            let decoded = aggregate::decode_events::<FlowEvent>(&stored)?;
            let current = aggregate::flow::fold(&decoded, flow_id);

            let mut tx = FlowTransaction::new();
            cmd(current.as_ref(), &mut tx)?;

            if tx.events.is_empty() {
                let state = current.ok_or_else(|| {
                    ExecutorError::Command(EngineError::flow_not_found(flow_id.clone()))
                })?;
                return Ok((state, tx.hooks));
            }

            let payload: Result<Vec<_>, _> = tx
                .events
                .iter()
                .map(|e| serde_json::to_value(e).map(|v| (e.event_type().to_string(), v)))
                .collect();
            let payload = payload.map_err(StoreError::Serialization)?;

            match self.store.append(&id, stored.len() as u64, payload).await {
                Ok(_) => {
                    let mut next = decoded.into_iter().map(|(e, t)| (e, t)).collect::<Vec<_>>();
                    let now = chrono::Utc::now();
                    next.extend(tx.events.into_iter().map(|e| (e, now)));
                    let new_state = aggregate::flow::fold(&next, flow_id)
                        .expect("command emitted events onto a nonexistent flow");
                    return Ok((new_state, tx.hooks));
                }
                Err(StoreError::Conflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.max_conflict_retries {
                        return Err(ExecutorError::ConflictExhausted(attempt));
                    }
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    pub async fn load_catalog(&self) -> Result<CatalogState, ExecutorError> {
        let id = AggregateId::catalog();
        let stored = self.store.get_events(&id, 0).await?;
        let decoded: Vec<CatalogEvent> = aggregate::decode_events::<CatalogEvent>(&stored)?
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        Ok(CatalogState::fold(&decoded))
    }

    pub async fn load_partition(&self) -> Result<PartitionState, ExecutorError> {
        let id = AggregateId::partition();
        let stored = self.store.get_events(&id, 0).await?;
        let decoded: Vec<PartitionEvent> = aggregate::decode_events::<PartitionEvent>(&stored)?
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        Ok(PartitionState::fold(&decoded))
    }

    pub async fn exec_catalog<F>(&self, cmd: F) -> Result<(CatalogState, Vec<Hook>), ExecutorError>
    where
        F: Fn(&CatalogState, &mut CatalogTransaction) -> Result<(), EngineError>,
    {
        let id = AggregateId::catalog();
        let mut attempt = 0;
        loop {
            let stored = self.store.get_events(&id, 0).await?;
            let decoded: Vec<CatalogEvent> = aggregate::decode_events::<CatalogEvent>(&stored)?
                .into_iter()
                .map(|(e, _)| e)
                .collect();
            let current = CatalogState::fold(&decoded);

            let mut tx = CatalogTransaction::new();
            cmd(&current, &mut tx)?;

            if tx.events.is_empty() {
                return Ok((current, tx.hooks));
            }

            let payload: Result<Vec<_>, _> = tx
                .events
                .iter()
                .map(|e| serde_json::to_value(e).map(|v| (e.event_type().to_string(), v)))
                .collect();
            let payload = payload.map_err(StoreError::Serialization)?;

            match self.store.append(&id, stored.len() as u64, payload).await {
                Ok(_) => {
                    let mut new_state = current;
                    for e in &tx.events {
                        new_state.apply(e);
                    }
                    return Ok((new_state, tx.hooks));
                }
                Err(StoreError::Conflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.max_conflict_retries {
                        return Err(ExecutorError::ConflictExhausted(attempt));
                    }
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    pub async fn exec_partition<F>(
        &self,
        cmd: F,
    ) -> Result<(PartitionState, Vec<Hook>), ExecutorError>
    where
        F: Fn(&PartitionState, &mut PartitionTransaction) -> Result<(), EngineError>,
    {
        let id = AggregateId::partition();
        let mut attempt = 0;
        loop {
            let stored = self.store.get_events(&id, 0).await?;
            let decoded: Vec<PartitionEvent> = aggregate::decode_events::<PartitionEvent>(&stored)?
                .into_iter()
                .map(|(e, _)| e)
                .collect();
            let current = PartitionState::fold(&decoded);

            let mut tx = PartitionTransaction::new();
            cmd(&current, &mut tx)?;

            if tx.events.is_empty() {
                return Ok((current, tx.hooks));
            }

            let payload: Result<Vec<_>, _> = tx
                .events
                .iter()
                .map(|e| serde_json::to_value(e).map(|v| (e.event_type().to_string(), v)))
                .collect();
            let payload = payload.map_err(StoreError::Serialization)?;

            match self.store.append(&id, stored.len() as u64, payload).await {
                Ok(_) => {
                    let mut new_state = current;
                    for e in &tx.events {
                        new_state.apply(e);
                    }
                    return Ok((new_state, tx.hooks));
                }
                Err(StoreError::Conflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.max_conflict_retries {
                        return Err(ExecutorError::ConflictExhausted(attempt));
                    }
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}

impl From<ExecutorError> for EngineError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Command(inner) => inner,
            ExecutorError::Store(store_err) => store_err.into(),
            other => EngineError::new(crate::error::ErrorKind::InvariantViolated, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryEventStore;
    use std::collections::HashMap;

    fn empty_plan() -> crate::model::ExecutionPlan {
        crate::model::ExecutionPlan {
            goals: vec![],
            steps: HashMap::new(),
            attributes: HashMap::new(),
            required: vec![],
            excluded: Default::default(),
        }
    }

    #[tokio::test]
    async fn starting_a_flow_persists_and_folds_state() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = Executor::new(store, ExecutorConfig::default());
        let flow_id = FlowId::new("f-1");

        let (state, hooks) = executor
            .exec_flow(&flow_id, |current, tx| {
                assert!(current.is_none());
                tx.emit(FlowEvent::FlowStarted {
                    plan: Box::new(empty_plan()),
                    init: HashMap::new(),
                    metadata: HashMap::new(),
                    labels: HashMap::new(),
                });
                tx.on_success(|| {});
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(state.status, crate::model::FlowStatus::Active);
        assert_eq!(hooks.len(), 1);
    }

    #[tokio::test]
    async fn second_command_sees_state_from_first() {
        let store = Arc::new(InMemoryEventStore::new());
        let executor = Executor::new(store, ExecutorConfig::default());
        let flow_id = FlowId::new("f-1");

        executor
            .exec_flow(&flow_id, |_current, tx| {
                tx.emit(FlowEvent::FlowStarted {
                    plan: Box::new(empty_plan()),
                    init: HashMap::new(),
                    metadata: HashMap::new(),
                    labels: HashMap::new(),
                });
                Ok(())
            })
            .await
            .unwrap();

        let (state, _) = executor
            .exec_flow(&flow_id, |current, tx| {
                assert!(current.is_some());
                tx.emit(FlowEvent::FlowFailed {
                    reason: "boom".into(),
                });
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(state.status, crate::model::FlowStatus::Failed);
    }
}
