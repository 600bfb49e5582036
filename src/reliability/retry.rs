//! Backoff calculation for work-item retries (spec §4.7).

use chrono::{DateTime, Utc};

use crate::model::{BackoffType, WorkConfig};

/// Whether a work item with `retry_count` prior attempts should retry again
/// under `config`.
pub fn should_retry(config: &WorkConfig, retry_count: u32) -> bool {
    match config.max_retries {
        0 => false,
        n if n < 0 => true,
        n => retry_count < n as u32,
    }
}

/// The backoff delay for the `n`-th retry (0-based), capped at
/// `config.max_backoff`. An unrecognized strategy falls back to `Fixed`.
pub fn delay_for_retry(config: &WorkConfig, n: u32) -> std::time::Duration {
    let base = config.init_backoff;
    let computed = match config.backoff_type {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(n + 1),
        BackoffType::Exponential => base.saturating_mul(1u32.checked_shl(n).unwrap_or(u32::MAX)),
    };
    computed.min(config.max_backoff)
}

/// The absolute time the `n`-th retry should fire.
pub fn calculate_next_retry(config: &WorkConfig, n: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay_for_retry(config, n)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(backoff: BackoffType) -> WorkConfig {
        WorkConfig {
            max_retries: 5,
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_type: backoff,
            parallelism: 1,
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let cfg = config(BackoffType::Fixed);
        assert_eq!(delay_for_retry(&cfg, 0), Duration::from_millis(100));
        assert_eq!(delay_for_retry(&cfg, 5), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let cfg = config(BackoffType::Linear);
        assert_eq!(delay_for_retry(&cfg, 0), Duration::from_millis(100));
        assert_eq!(delay_for_retry(&cfg, 2), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let cfg = config(BackoffType::Exponential);
        assert_eq!(delay_for_retry(&cfg, 0), Duration::from_millis(100));
        assert_eq!(delay_for_retry(&cfg, 1), Duration::from_millis(200));
        assert_eq!(delay_for_retry(&cfg, 2), Duration::from_millis(400));
        assert_eq!(delay_for_retry(&cfg, 10), Duration::from_secs(10));
    }

    #[test]
    fn max_retries_zero_never_retries() {
        let cfg = WorkConfig {
            max_retries: 0,
            ..config(BackoffType::Fixed)
        };
        assert!(!should_retry(&cfg, 0));
    }

    #[test]
    fn negative_max_retries_is_unlimited() {
        let cfg = WorkConfig {
            max_retries: -1,
            ..config(BackoffType::Fixed)
        };
        assert!(should_retry(&cfg, 1_000_000));
    }
}
