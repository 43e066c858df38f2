//! Deduplicating work queue
//!
//! A key is queued at most once and processed by at most one worker at a
//! time. A key pushed while it is being processed is queued again when the
//! worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::store::RecordKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<RecordKey>,
    queued: HashSet<RecordKey>,
    active: HashSet<RecordKey>,
    dirty: HashSet<RecordKey>,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, key: RecordKey) {
        let mut state = self.lock();
        if state.queued.contains(&key) {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }

        state.queued.insert(key.clone());
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Push `key` once `delay` has passed
    pub fn push_after(self: &Arc<Self>, key: RecordKey, delay: Duration) {
        if delay.is_zero() {
            self.push(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(key);
        });
    }

    /// Wait for the next key and mark it active
    pub async fn pop(&self) -> RecordKey {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            notified.await;
        }
    }

    /// Release `key`, queueing it again if it was pushed meanwhile
    pub fn done(&self, key: &RecordKey) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) {
            state.queued.insert(key.clone());
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
