//! Appliers that fold each aggregate's event stream into typed state
//! (spec §4.1, §2.2).

pub mod catalog;
pub mod flow;
pub mod partition;

pub use catalog::CatalogState;
pub use partition::PartitionState;

use crate::store::{StoreError, StoredEvent};
use serde::de::DeserializeOwned;

/// Deserialize a batch of stored, JSON-encoded events into a typed event
/// enum, preserving their recorded timestamps.
pub fn decode_events<E: DeserializeOwned>(
    stored: &[StoredEvent],
) -> Result<Vec<(E, chrono::DateTime<chrono::Utc>)>, StoreError> {
    stored
        .iter()
        .map(|e| {
            let event: E = serde_json::from_value(e.data.clone()).map_err(StoreError::Serialization)?;
            Ok((event, e.recorded_at))
        })
        .collect()
}
