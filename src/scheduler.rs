//! The wall-clock task scheduler (spec §4.2): a keyed min-heap of
//! `(path, when, fn)` tasks driving every retry and optional-input timeout
//! in the system.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::clock::Clock;

/// A unit of future work, keyed by `path` so it can be replaced or
/// cancelled. `Arc`-shared rather than `FnOnce` so a failing task can be
/// rescheduled under the same path without losing its closure.
pub type TaskFn = Arc<dyn Fn() -> TaskResult + Send + Sync>;
pub type TaskResult = Result<(), anyhow::Error>;

struct Task {
    path: Vec<String>,
    at: DateTime<Utc>,
    func: TaskFn,
    /// Monotonic generation, used to break ties and to detect a task that
    /// was cancelled/replaced after being pushed onto the heap.
    generation: u64,
}

struct HeapEntry {
    at: DateTime<Utc>,
    path: Vec<String>,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest `at` first.
        other.at.cmp(&self.at)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<Vec<String>, Task>,
    next_generation: u64,
}

/// The scheduler: `Schedule`/`Cancel`/`CancelPrefix` are serialized through a
/// single mutex guarding the heap and task table; one worker loop wakes at
/// the next due time and fires all due tasks.
pub struct TaskScheduler {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl TaskScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            clock,
        }
    }

    /// Schedule `func` to run at `at` under `path`. If another task already
    /// holds this exact path, it is replaced — only the newest wins. This is
    /// how a retry or optional-input timeout is "reset".
    pub fn schedule(&self, path: Vec<String>, at: DateTime<Utc>, func: TaskFn) {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.tasks.insert(
            path.clone(),
            Task {
                path: path.clone(),
                at,
                func,
                generation,
            },
        );
        inner.heap.push(HeapEntry {
            at,
            path,
            generation,
        });
        drop(inner);
        self.notify.notify_one();
    }

    pub fn cancel(&self, path: &[String]) {
        let mut inner = self.inner.lock();
        inner.tasks.remove(path);
    }

    /// Cancel every task whose path starts with `prefix`.
    pub fn cancel_prefix(&self, prefix: &[String]) {
        let mut inner = self.inner.lock();
        inner
            .tasks
            .retain(|path, _| !(path.len() >= prefix.len() && path[..prefix.len()] == *prefix));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Run the single worker loop until `shutdown` is notified. Intended to
    /// be spawned once by [`crate::engine::Engine::start`].
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let sleep_for = {
                let inner = self.inner.lock();
                inner.heap.peek().map(|entry| entry.at)
            };

            let sleep_duration = match sleep_for {
                Some(at) => {
                    let now = self.clock.now();
                    if at <= now {
                        Duration::ZERO
                    } else {
                        (at - now).to_std().unwrap_or(Duration::ZERO)
                    }
                }
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {}
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        return;
                    }
                }
            }

            if *shutdown.borrow() {
                return;
            }

            self.fire_due().await;
        }
    }

    async fn fire_due(&self) {
        let due: Vec<(Vec<String>, TaskFn)> = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            let mut due = Vec::new();
            while let Some(entry) = inner.heap.peek() {
                if entry.at > now {
                    break;
                }
                let entry = inner.heap.pop().unwrap();
                let Some(task) = inner.tasks.get(&entry.path) else {
                    continue; // cancelled
                };
                if task.generation != entry.generation {
                    continue; // superseded by a later schedule() call
                }
                let task = inner.tasks.remove(&entry.path).unwrap();
                due.push((task.path, task.func));
            }
            due
        };

        for (path, func) in due {
            debug!(?path, "firing scheduled task");
            match func() {
                Ok(()) => {}
                Err(err) => {
                    warn!(?path, %err, "scheduled task failed, retrying shortly");
                    self.schedule(
                        path,
                        self.clock.now() + chrono::Duration::seconds(1),
                        func,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn replacing_a_path_keeps_only_the_newest() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let scheduler = TaskScheduler::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(vec!["x".into()], clock.now(), Arc::new(|| Ok(())));
        let fired2 = fired.clone();
        scheduler.schedule(
            vec!["x".into()],
            clock.now(),
            Arc::new(move || {
                fired2.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }),
        );

        scheduler.fire_due().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_prefix_removes_matching_tasks() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let scheduler = TaskScheduler::new(clock.clone());
        scheduler.schedule(
            vec!["retry".into(), "f1".into(), "s1".into()],
            clock.now(),
            Arc::new(|| Ok(())),
        );
        scheduler.schedule(
            vec!["retry".into(), "f2".into(), "s1".into()],
            clock.now(),
            Arc::new(|| Ok(())),
        );
        scheduler.cancel_prefix(&["retry".to_string(), "f1".to_string()]);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[tokio::test]
    async fn tasks_only_fire_once_due() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let scheduler = TaskScheduler::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler.schedule(
            vec!["later".into()],
            clock.now() + chrono::Duration::seconds(10),
            Arc::new(move || {
                fired2.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }),
        );
        scheduler.fire_due().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        clock.advance(chrono::Duration::seconds(11));
        scheduler.fire_due().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }
}
