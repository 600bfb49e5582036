//! A PostgreSQL-backed [`EventStore`].
//!
//! Schema (see `migrations/` in a deployment of this crate):
//!
//! ```sql
//! CREATE TABLE flowctl_events (
//!     aggregate_id TEXT NOT NULL,
//!     seq BIGINT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     data JSONB NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (aggregate_id, seq)
//! );
//!
//! CREATE TABLE flowctl_snapshots (
//!     aggregate_id TEXT PRIMARY KEY,
//!     seq BIGINT NOT NULL,
//!     state JSONB NOT NULL
//! );
//! ```
//!
//! Aggregate ids are joined with `/` to form the `aggregate_id` column;
//! `list_aggregates` matches on a `LIKE 'prefix/%'` clause.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{AggregateId, EventStore, Snapshot, StoreError, StoredEvent};

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn join_id(id: &AggregateId) -> String {
    id.0.join("/")
}

fn split_id(raw: &str) -> AggregateId {
    AggregateId(raw.split('/').map(|s| s.to_string()).collect())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn get_events(
        &self,
        id: &AggregateId,
        from_seq: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, event_type, data, recorded_at FROM flowctl_events \
             WHERE aggregate_id = $1 AND seq >= $2 ORDER BY seq ASC",
        )
        .bind(join_id(id))
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredEvent {
                    seq: row.try_get::<i64, _>("seq").map_err(|e| StoreError::Backend(e.into()))? as u64,
                    event_type: row
                        .try_get("event_type")
                        .map_err(|e| StoreError::Backend(e.into()))?,
                    data: row.try_get("data").map_err(|e| StoreError::Backend(e.into()))?,
                    recorded_at: row
                        .try_get("recorded_at")
                        .map_err(|e| StoreError::Backend(e.into()))?,
                })
            })
            .collect()
    }

    async fn list_aggregates(&self, prefix: &[String]) -> Result<Vec<AggregateId>, StoreError> {
        let pattern = format!("{}%", prefix.join("/"));
        let rows = sqlx::query(
            "SELECT DISTINCT aggregate_id FROM flowctl_events WHERE aggregate_id LIKE $1",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("aggregate_id").map_err(|e| StoreError::Backend(e.into()))?;
                Ok(split_id(&raw))
            })
            .collect()
    }

    async fn append(
        &self,
        id: &AggregateId,
        expected_next_seq: u64,
        events: Vec<(String, serde_json::Value)>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM flowctl_events WHERE aggregate_id = $1",
        )
        .bind(join_id(id))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        if current as u64 != expected_next_seq {
            return Err(StoreError::Conflict {
                aggregate: id.clone(),
                expected: expected_next_seq,
                actual: current as u64,
            });
        }

        let mut seq = current;
        for (event_type, data) in events {
            sqlx::query(
                "INSERT INTO flowctl_events (aggregate_id, seq, event_type, data) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(join_id(id))
            .bind(seq)
            .bind(event_type)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            seq += 1;
        }

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(seq as u64)
    }

    async fn save_snapshot(&self, id: &AggregateId, snapshot: Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO flowctl_snapshots (aggregate_id, seq, state) VALUES ($1, $2, $3) \
             ON CONFLICT (aggregate_id) DO UPDATE SET seq = EXCLUDED.seq, state = EXCLUDED.state",
        )
        .bind(join_id(id))
        .bind(snapshot.seq as i64)
        .bind(snapshot.state)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn load_snapshot(&self, id: &AggregateId) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query("SELECT seq, state FROM flowctl_snapshots WHERE aggregate_id = $1")
            .bind(join_id(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(Snapshot {
                seq: row.try_get::<i64, _>("seq").map_err(|e| StoreError::Backend(e.into()))? as u64,
                state: row.try_get("state").map_err(|e| StoreError::Backend(e.into()))?,
            })),
        }
    }
}
