//! An in-memory [`EventStore`], used by tests and the in-process demo path.
//!
//! Grounded on the teacher's `InMemoryWorkflowEventStore`: a single
//! `RwLock<HashMap<_, _>>` guarding append-with-optimistic-concurrency.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{AggregateId, EventStore, Snapshot, StoreError, StoredEvent};

#[derive(Default)]
struct Stream {
    events: Vec<StoredEvent>,
    snapshot: Option<Snapshot>,
}

/// An in-memory event store. Not durable across process restarts; intended
/// for tests and the demo binary, not production use.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Stream>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_events(
        &self,
        id: &AggregateId,
        from_seq: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let streams = self.streams.read();
        let Some(stream) = streams.get(id) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .events
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect())
    }

    async fn list_aggregates(&self, prefix: &[String]) -> Result<Vec<AggregateId>, StoreError> {
        let streams = self.streams.read();
        Ok(streams
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn append(
        &self,
        id: &AggregateId,
        expected_next_seq: u64,
        events: Vec<(String, serde_json::Value)>,
    ) -> Result<u64, StoreError> {
        let mut streams = self.streams.write();
        let stream = streams.entry(id.clone()).or_default();
        let current_len = stream.events.len() as u64;
        if current_len != expected_next_seq {
            return Err(StoreError::Conflict {
                aggregate: id.clone(),
                expected: expected_next_seq,
                actual: current_len,
            });
        }
        let mut last_seq = current_len;
        for (event_type, data) in events {
            let stored = StoredEvent {
                seq: last_seq,
                event_type,
                data,
                recorded_at: chrono::Utc::now(),
            };
            stream.events.push(stored);
            last_seq += 1;
        }
        Ok(last_seq)
    }

    async fn save_snapshot(&self, id: &AggregateId, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut streams = self.streams.write();
        let stream = streams.entry(id.clone()).or_default();
        stream.snapshot = Some(snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, id: &AggregateId) -> Result<Option<Snapshot>, StoreError> {
        let streams = self.streams.read();
        Ok(streams.get(id).and_then(|s| s.snapshot.clone()))
    }
}
