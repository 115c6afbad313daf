//! Deduplicating Work Queue
//!
//! Keys waiting to be reconciled. A key is queued at most once, and a key a
//! worker is holding is never handed to a second worker: adding it again
//! marks it dirty and it is re-queued when the first worker calls
//! [`WorkQueue::done`]. Failed keys come back after a per-key exponential
//! backoff.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

// =============================================================================
// Configuration
// =============================================================================

/// Retry timing for failed keys
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the delay between retries
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

// =============================================================================
// Queue State
// =============================================================================

struct Failures {
    count: u32,
    backoff: ExponentialBackoff,
}

struct QueueState<K> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Backoff per failing key
    failures: HashMap<K, Failures>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// Deduplicating queue of object keys
pub struct WorkQueue<K> {
    config: QueueConfig,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create a queue with default retry timing
    pub fn new() -> Arc<Self> {
        Self::with_config(QueueConfig::default())
    }

    /// Create a queue with custom retry timing
    pub fn with_config(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Queue a key for processing
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                trace!(?key, "Key already pending");
                return;
            }
            if state.processing.contains(&key) {
                trace!(?key, "Key in flight, will requeue when done");
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue a key after its next backoff interval
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = self.next_delay(&key);
        self.add_after(key, delay);
        delay
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut state = self.state.lock();
        let failures = state.failures.entry(key.clone()).or_insert_with(|| Failures {
            count: 0,
            backoff: self.config.new_backoff(),
        });
        failures.count += 1;
        failures
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_delay)
    }

    /// Clear the failure history of a key
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Number of failures recorded for a key since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state
            .lock()
            .failures
            .get(key)
            .map(|f| f.count)
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key obtained from [`WorkQueue::get`]
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn quick_queue() -> Arc<WorkQueue<String>> {
        WorkQueue::with_config(QueueConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        })
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = quick_queue();
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_handed_out_twice() {
        let queue = quick_queue();
        queue.add("a".to_string());
        let key = queue.get().await.unwrap();

        // Re-added while held: must not be visible to another worker
        queue.add("a".to_string());
        assert!(queue.is_empty());

        let mut second = tokio_test::task::spawn(queue.get());
        assert_pending!(second.poll());

        queue.done(&key);
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = quick_queue();
        queue.add("a".to_string());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let queue = quick_queue();
        let key = "a".to_string();
        assert_eq!(queue.next_delay(&key), Duration::from_millis(10));
        assert_eq!(queue.next_delay(&key), Duration::from_millis(20));
        assert_eq!(queue.next_delay(&key), Duration::from_millis(40));
        assert_eq!(queue.next_delay(&key), Duration::from_millis(40));
        assert_eq!(queue.num_requeues(&key), 4);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
        assert_eq!(queue.next_delay(&key), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limited_key_returns() {
        let queue = quick_queue();
        queue.add_rate_limited("a".to_string());
        assert!(queue.is_empty());

        let key = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .expect("key should come back after its backoff");
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = quick_queue();
        queue.add("a".to_string());
        queue.shut_down();
        queue.add("b".to_string());

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = quick_queue();
        let mut waiting = tokio_test::task::spawn(queue.get());
        assert_pending!(waiting.poll());

        queue.shut_down();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), None);
    }
}
