//! Keyed work queue
//!
//! A key is handed to at most one worker at a time. Adding a key while it is
//! being processed marks it dirty; it is queued again when the worker calls
//! [`WorkQueue::done`]. Duplicate adds of a waiting key collapse into one.
//! Failed keys are re-added after a per-key exponential delay.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Retry delays for failed keys
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    config: WorkQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Queue `key` after its next backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            self.delay_for(*failures)
        };
        debug!("Requeueing {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Delay before retry number `failures` (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let base = self.config.base_delay.as_nanos() as u64;
        let delay = Duration::from_nanos(base.saturating_mul(factor));
        delay.min(self.config.max_delay)
    }

    /// Next key to process; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` finished; queues it again if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(WorkQueueConfig::default())
    }

    #[test]
    fn test_duplicate_adds_collapse() {
        let q = queue();
        q.add("default/a");
        q.add("default/a");
        q.add("default/b");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_get_waits_for_add() {
        let q = queue();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.add("default/a");
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), Some("default/a".to_string()));
    }

    #[test]
    fn test_key_in_flight_is_not_handed_out_twice() {
        let q = queue();
        q.add("default/a");
        let key = task::spawn(q.get()).poll();
        assert_eq!(key, std::task::Poll::Ready(Some("default/a".to_string())));

        // Re-added while processing: held back until done
        q.add("default/a");
        assert!(q.is_empty());
        let mut second = task::spawn(q.get());
        assert_pending!(second.poll());

        q.done("default/a");
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Some("default/a".to_string()));
    }

    #[test]
    fn test_done_without_readd_leaves_queue_empty() {
        let q = queue();
        q.add("default/a");
        let _ = task::spawn(q.get()).poll();
        q.done("default/a");
        assert!(q.is_empty());
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let q = queue();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.shut_down();
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), None);

        q.add("default/a");
        assert!(q.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let q = queue();
        assert_eq!(q.delay_for(1), Duration::from_millis(5));
        assert_eq!(q.delay_for(2), Duration::from_millis(10));
        assert_eq!(q.delay_for(5), Duration::from_millis(80));
        assert_eq!(q.delay_for(40), Duration::from_secs(1000));
        assert_eq!(q.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn test_rate_limited_requeue() {
        let q = queue();
        q.add_rate_limited("default/a");
        q.add_rate_limited("default/a");
        assert_eq!(q.num_requeues("default/a"), 2);
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.get().await, Some("default/a".to_string()));

        q.forget("default/a");
        assert_eq!(q.num_requeues("default/a"), 0);
    }
}
