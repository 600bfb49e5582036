//! The event store: the append-only log every aggregate is rebuilt from
//! (spec §6, "Event store (consumed)").

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one aggregate's event stream: `["catalog"]`, `["partition"]`,
/// or `["flow", flow_id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateId(pub Vec<String>);

impl AggregateId {
    pub fn catalog() -> Self {
        Self(vec!["catalog".to_string()])
    }

    pub fn partition() -> Self {
        Self(vec!["partition".to_string()])
    }

    pub fn flow(flow_id: impl std::fmt::Display) -> Self {
        Self(vec!["flow".to_string(), flow_id.to_string()])
    }

    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.0.len() >= prefix.len() && self.0[..prefix.len()] == *prefix
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One persisted, already-committed event. `data` is the JSON encoding of
/// the aggregate-specific event enum (`FlowEvent`, `CatalogEvent`,
/// `PartitionEvent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    pub event_type: String,
    pub data: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A snapshot of an aggregate's folded state at a given sequence number, as
/// a replay-shortcut optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub state: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("aggregate {0} not found")]
    NotFound(AggregateId),

    #[error("append to {aggregate} conflicted: expected next seq {expected}, store has {actual}")]
    Conflict {
        aggregate: AggregateId,
        expected: u64,
        actual: u64,
    },

    #[error("store backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// The persistence primitive every aggregate is built on.
///
/// Implementations must guarantee that a successful [`EventStore::append`]
/// call is atomic and that the optimistic-concurrency check on
/// `expected_next_seq` is enforced without external locking.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_events(
        &self,
        id: &AggregateId,
        from_seq: u64,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// List every aggregate id whose first path segment matches `prefix`
    /// (e.g. `["flow"]` lists every flow, regardless of id).
    async fn list_aggregates(&self, prefix: &[String]) -> Result<Vec<AggregateId>, StoreError>;

    /// Append `events` if and only if the aggregate's current length equals
    /// `expected_next_seq`. Returns the sequence number assigned to the last
    /// appended event.
    async fn append(
        &self,
        id: &AggregateId,
        expected_next_seq: u64,
        events: Vec<(String, serde_json::Value)>,
    ) -> Result<u64, StoreError>;

    async fn save_snapshot(
        &self,
        id: &AggregateId,
        snapshot: Snapshot,
    ) -> Result<(), StoreError>;

    async fn load_snapshot(&self, id: &AggregateId) -> Result<Option<Snapshot>, StoreError>;
}
