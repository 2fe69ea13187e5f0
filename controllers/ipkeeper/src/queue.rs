//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the classic controller work queue:
//!
//! - a key is queued at most once while pending
//! - a key added while a worker holds it is processed again after `done`
//! - failures re-add the key after a per-key exponential delay
//! - `shut_down` wakes the worker, discards pending keys and ignores later adds
//!
//! The queue never interprets keys; handlers receive them as added.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    max_retries: u32,
    dropped: AtomicU64,
}

/// Work queue shared between an intake and its worker
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("max_retries", &self.inner.max_retries)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create an empty queue
    pub fn new(name: &'static str, backoff: ExponentialBackoff, max_retries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
                max_retries,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name, for logs
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Failed attempts allowed before an item is dropped
    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-add `key` once its backoff has elapsed
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.for_failures(*failures);
            *failures += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Times `key` has been re-added since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before the check so a concurrent add or shut_down is not missed
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; re-queues it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and ignore further adds
    pub fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Whether `shut_down` was called
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items dropped after exhausting their retries
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drain `queue` through `handler` until the queue is shut down.
///
/// Successes forget the key's backoff. Failures are re-added with backoff
/// until the queue's retry ceiling, after which the key is dropped with an
/// error log and counted.
pub async fn run_worker<K, F, Fut>(queue: WorkQueue<K>, handler: F)
where
    K: Clone + Eq + Hash + Send + Display + 'static,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<(), ControllerError>>,
{
    debug!("Starting {} worker", queue.name());
    while let Some(key) = queue.get().await {
        match handler(key.clone()).await {
            Ok(()) => {
                queue.forget(&key);
                debug!("Successfully synced {} '{}'", queue.name(), key);
            }
            Err(e) if queue.num_requeues(&key) < queue.max_retries() => {
                warn!(
                    "Error syncing {} '{}' (attempt {}), will retry: {}",
                    queue.name(),
                    key,
                    queue.num_requeues(&key) + 1,
                    e
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(
                    "Dropping {} '{}' after {} failed attempts: {}",
                    queue.name(),
                    key,
                    queue.num_requeues(&key) + 1,
                    e
                );
                queue.forget(&key);
                queue.record_drop();
            }
        }
        queue.done(&key);
    }
    debug!("{} worker stopped", queue.name());
}
