//! The memo cache (spec §2.7): an LRU of `(step-fingerprint, inputs) ->
//! outputs` for steps marked `memoizable`.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use lru::LruCache;

use crate::model::{Args, StepId};

fn fingerprint(step_id: &StepId, inputs: &Args) -> [u8; 32] {
    // Canonicalize by sorting keys so insertion order never affects the key.
    let mut keys: Vec<&String> = inputs.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    hasher.update(step_id.as_str().as_bytes());
    hasher.update([0u8]);
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        // serde_json::Value serializes deterministically for our purposes
        // (map keys within a value are not re-sorted, but steps only ever
        // receive flat, declared-attribute inputs here).
        let encoded = serde_json::to_vec(&inputs[key]).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

/// A concurrent LRU cache of memoized step outcomes.
pub struct MemoCache {
    inner: Mutex<LruCache<[u8; 32], Args>>,
}

impl MemoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    pub fn get(&self, step_id: &StepId, inputs: &Args) -> Option<Args> {
        let key = fingerprint(step_id, inputs);
        self.inner.lock().get(&key).cloned()
    }

    pub fn put(&self, step_id: &StepId, inputs: &Args, outputs: Args) {
        let key = fingerprint(step_id, inputs);
        self.inner.lock().put(key, outputs);
    }
}
