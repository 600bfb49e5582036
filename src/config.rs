//! Engine-wide configuration (ambient stack: no file/env loading here — that
//! is an excluded outer layer; this is the programmatic knob surface the
//! rest of the engine is built against).

use std::time::Duration;

use crate::event_queue::EventQueueConfig;
use crate::executor::ExecutorConfig;
use crate::model::WorkConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default `WorkConfig`, used to fill in any zero-valued fields on a
    /// step's own `WorkConfig` override.
    pub default_work: WorkConfig,
    pub executor: ExecutorConfig,
    pub event_queue: EventQueueConfig,
    /// Capacity of the memo cache (entries), shared across all memoizable
    /// steps.
    pub memo_cache_capacity: usize,
    /// Capacity of the compiled-script cache.
    pub script_cache_capacity: usize,
    /// How many flows `RecoverFlows` processes concurrently on startup.
    pub recovery_concurrency: usize,
    /// Backoff applied to a scheduler task whose `Func` returned an error.
    pub scheduler_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_work: WorkConfig::default(),
            executor: ExecutorConfig::default(),
            event_queue: EventQueueConfig::default(),
            memo_cache_capacity: 10_000,
            script_cache_capacity: 1_000,
            recovery_concurrency: 16,
            scheduler_retry_backoff: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_default_work(mut self, work: WorkConfig) -> Self {
        self.default_work = work;
        self
    }

    pub fn with_memo_cache_capacity(mut self, capacity: usize) -> Self {
        self.memo_cache_capacity = capacity;
        self
    }

    pub fn with_recovery_concurrency(mut self, concurrency: usize) -> Self {
        self.recovery_concurrency = concurrency;
        self
    }
}
