//! Deduplicating work queue.
//!
//! A key is held at most once: either pending in the queue or being
//! processed. Adding a key which is being processed marks it dirty, it is put
//! back into the queue once processing is [`WorkQueue::done`]. This makes sure
//! the same key is never handed to two workers at the same time, and that a
//! change observed while a key was processed is not lost.

use crate::rate_limiter::RateLimiter;

use std::{
    collections::{HashSet, VecDeque},
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, sync::Notify, time::sleep};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys which need processing, pending or not.
    dirty: HashSet<String>,
    /// Keys currently handed out to a worker.
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Default::default(),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: impl Into<String>) {
        let item = item.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key to process.
    ///
    /// Returns `None` once the queue is shut down and all pending keys have
    /// been handed out. Every returned key must be passed to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wake-up on, another worker may be waiting.
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. If it was added again in the meantime it is
    /// queued once more.
    pub fn done(&self, item: &str) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys. Workers drain what is left and then get `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

/// [`WorkQueue`] with delayed and rate limited adds.
pub struct RateLimitingQueue {
    queue: Arc<WorkQueue>,
    rate_limiter: Box<dyn RateLimiter>,
}

impl RateLimitingQueue {
    pub fn new(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(name)),
            rate_limiter,
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn add(&self, item: impl Into<String>) {
        self.queue.add(item)
    }

    /// Add `item` once `delay` has passed.
    pub fn add_after(&self, item: impl Into<String>, delay: Duration) {
        let item = item.into();
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let queue = self.queue.clone();
                handle.spawn(async move {
                    sleep(delay).await;
                    queue.add(item);
                });
            }
            Err(_) => {
                debug!(
                    "no async runtime to delay {} in queue {}, adding it right away",
                    item,
                    self.queue.name()
                );
                self.queue.add(item);
            }
        }
    }

    /// Add `item` after the delay the rate limiter decides on.
    pub fn add_rate_limited(&self, item: impl Into<String>) {
        let item = item.into();
        let delay = self.rate_limiter.when(item.as_str());
        self.add_after(item, delay)
    }

    /// Reset the rate limiter's history for `item`.
    pub fn forget(&self, item: &str) {
        self.rate_limiter.forget(item)
    }

    pub fn num_requeues(&self, item: &str) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub async fn get(&self) -> Option<String> {
        self.queue.get().await
    }

    pub fn done(&self, item: &str) {
        self.queue.done(item)
    }

    pub fn shut_down(&self) {
        self.queue.shut_down()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
