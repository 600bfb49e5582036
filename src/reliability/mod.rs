//! Backoff calculation shared by the work executor and the flow
//! orchestrator.

mod retry;

pub use retry::{calculate_next_retry, delay_for_retry, should_retry};
