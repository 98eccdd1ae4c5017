//! Weir work queue: a FIFO of dirty keys, coalesced per key.
//!
//! Every key moves through `Idle -> Queued -> Processing -> Idle`. Adding a key
//! that is being processed parks it in `ProcessingDirty`; `done` then puts it
//! back at the tail, so a worker always re-reads the latest state and never
//! runs concurrently with another worker on the same key.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weir_core::{Backoff, ObjectKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Processing,
    ProcessingDirty,
}

struct State {
    order: VecDeque<ObjectKey>,
    // absent means idle
    keys: FxHashMap<ObjectKey, KeyState>,
    failures: FxHashMap<ObjectKey, u32>,
    shutting_down: bool,
}

impl State {
    fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.keys.insert(key.clone(), KeyState::Processing);
        gauge!("weir_queue_depth", self.order.len() as f64);
        Some(key)
    }
}

struct Shared {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
    backoff: Backoff,
}

/// Cloneable handle; clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// `backoff` drives [`WorkQueue::add_rate_limited`].
    pub fn new(name: &str, backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    keys: FxHashMap::default(),
                    failures: FxHashMap::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &str { &self.shared.name }

    /// Mark `key` dirty. Coalesced when already queued; deferred until `done`
    /// when in flight. Ignored after shutdown.
    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        match st.keys.get(&key).copied() {
            None => {
                st.keys.insert(key.clone(), KeyState::Queued);
                st.order.push_back(key);
                gauge!("weir_queue_depth", st.order.len() as f64);
                counter!("weir_queue_adds_total", 1);
                drop(st);
                self.shared.notify.notify_one();
            }
            Some(KeyState::Processing) => {
                st.keys.insert(key, KeyState::ProcessingDirty);
            }
            Some(KeyState::Queued | KeyState::ProcessingDirty) => {}
        }
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent add or shutdown is not missed
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.pop() {
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`WorkQueue::get`].
    pub fn try_get(&self) -> Option<ObjectKey> {
        let mut st = self.lock();
        if st.shutting_down {
            return None;
        }
        st.pop()
    }

    /// Finish processing `key`. A key re-added meanwhile is queued again.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        match st.keys.get(key).copied() {
            Some(KeyState::Processing) => {
                st.keys.remove(key);
            }
            Some(KeyState::ProcessingDirty) => {
                if st.shutting_down {
                    st.keys.remove(key);
                    return;
                }
                st.keys.insert(key.clone(), KeyState::Queued);
                st.order.push_back(key.clone());
                gauge!("weir_queue_depth", st.order.len() as f64);
                drop(st);
                self.shared.notify.notify_one();
            }
            Some(KeyState::Queued) | None => {
                warn!(queue = %self.shared.name, key = %key, "queue: done called for a key that is not in flight");
            }
        }
    }

    /// Clear the retry bookkeeping for `key`.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Requeue after the per-key exponential delay; returns the delay used.
    pub fn add_rate_limited(&self, key: ObjectKey) -> Duration {
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        let delay = self.shared.backoff.delay(attempt);
        counter!("weir_queue_retries_total", 1);
        debug!(queue = %self.shared.name, key = %key, attempt, delay_ms = %delay.as_millis(), "queue: requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Add `key` once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Keys waiting to be handed out (in-flight keys excluded).
    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
        info!(queue = %self.shared.name, "queue: shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}
