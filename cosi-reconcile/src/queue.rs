//! Deduplicating work queue with delayed and rate-limited re-enqueue.
//!
//! An item is never handed to two workers at once: while it is being
//! processed further adds only mark it dirty, and it is re-queued when the
//! worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::rate_limiter::ExponentialBackoff;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    limiter: ExponentialBackoff<T>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    shutdown: CancellationToken,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(limiter: ExponentialBackoff<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    limiter,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let mut state = self.state();
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Re-adds `item` after its backoff delay and records the failure.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.state().limiter.when(&item);
        self.add_after(item, delay);
        delay
    }

    /// Drops the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.state().limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().limiter.num_requeues(item)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutting_down() {
                return None;
            }
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    // wake another worker if more work is waiting
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Marks `item` as finished. Adds that arrived while it was processed
    /// put it back on the queue.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
