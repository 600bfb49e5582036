//! The partition event queue (spec §2.5): a single-consumer batched queue
//! that delivers partition-aggregate events with retry on handler failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::events::PartitionEvent;

#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    pub batch_size: usize,
    pub max_handler_retries: u32,
    pub retry_delay: Duration,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_handler_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Anything that can apply a batch of partition events — in practice the
/// engine's own partition-command closure.
#[async_trait::async_trait]
pub trait PartitionEventHandler: Send + Sync {
    async fn handle(&self, events: &[PartitionEvent]) -> Result<(), anyhow::Error>;
}

pub struct EventQueue {
    sender: mpsc::UnboundedSender<PartitionEvent>,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PartitionEvent>>>,
    config: EventQueueConfig,
}

impl EventQueue {
    pub fn new(config: EventQueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            config,
        }
    }

    /// Enqueue one event for eventual delivery to the handler. Never blocks;
    /// called from after-commit hooks.
    pub fn enqueue(&self, event: PartitionEvent) {
        if self.sender.send(event).is_err() {
            error!("event queue worker has shut down, dropping partition event");
        }
    }

    /// Run the single worker loop, batching up to `batch_size` events and
    /// retrying the handler up to `max_handler_retries` times before giving
    /// up on a batch and logging it as dropped.
    pub async fn run(&self, handler: Arc<dyn PartitionEventHandler>) {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .expect("EventQueue::run called more than once");

        let mut batch = Vec::with_capacity(self.config.batch_size);
        loop {
            batch.clear();
            let Some(first) = receiver.recv().await else {
                return; // sender dropped: engine is shutting down
            };
            batch.push(first);
            while batch.len() < self.config.batch_size {
                match receiver.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            let mut attempt = 0;
            loop {
                match handler.handle(&batch).await {
                    Ok(()) => break,
                    Err(err) => {
                        attempt += 1;
                        if attempt >= self.config.max_handler_retries {
                            warn!(%err, batch_len = batch.len(), "dropping partition event batch after exhausting retries");
                            break;
                        }
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<PartitionEvent>>,
        fail_first_n: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PartitionEventHandler for RecordingHandler {
        async fn handle(&self, events: &[PartitionEvent]) -> Result<(), anyhow::Error> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated failure");
            }
            self.seen.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_enqueued_events_to_handler() {
        let queue = Arc::new(EventQueue::new(EventQueueConfig::default()));
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(0),
        });

        let flow_id = crate::model::FlowId::new("f-1");
        queue.enqueue(PartitionEvent::FlowActivated {
            flow_id: flow_id.clone(),
        });

        let queue2 = queue.clone();
        let handler2 = handler.clone();
        let task = tokio::spawn(async move { queue2.run(handler2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        drop(queue);
        let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
    }

    #[tokio::test]
    async fn retries_on_handler_failure() {
        let queue = Arc::new(EventQueue::new(EventQueueConfig {
            retry_delay: Duration::from_millis(5),
            ..EventQueueConfig::default()
        }));
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(2),
        });

        queue.enqueue(PartitionEvent::FlowActivated {
            flow_id: crate::model::FlowId::new("f-1"),
        });

        let queue2 = queue.clone();
        let handler2 = handler.clone();
        let task = tokio::spawn(async move { queue2.run(handler2).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        drop(queue);
        let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
    }
}
