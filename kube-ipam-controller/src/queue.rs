use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};

use kube_ipam_core::lease::LeaseKey;
use log::trace;
use tokio::sync::{Mutex, Notify};

/// Unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    Subnet(String),
    Lease(LeaseKey),
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<WorkKey>,
    /// keys waiting to be processed, each is queued at most once
    dirty: HashSet<WorkKey>,
    /// keys a worker currently holds
    processing: HashSet<WorkKey>,
    failures: HashMap<WorkKey, u32>,
    shutdown: bool,
}

/// De-duplicating work queue. A key is never handed to two workers at once:
/// a key added while it's being processed is queued again once the worker
/// calls [`WorkQueue::done`].
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: WorkKey) {
        let mut state = self.state.lock().await;

        if state.shutdown || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());

        if state.processing.contains(&key) {
            trace!("{key} is being processed, it'll be queued again once done");
            return;
        }

        state.queue.push_back(key);
        self.notify.notify_one();
    }

    pub async fn add_all(&self, keys: impl IntoIterator<Item = WorkKey>) {
        for key in keys {
            self.add(key).await;
        }
    }

    /// Adds the key once the delay passes.
    pub fn add_after(self: &Arc<Self>, key: WorkKey, delay: Duration) {
        let queue = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Waits for the next key, `None` once the queue is shut down.
    pub async fn next(&self) -> Option<WorkKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut state = self.state.lock().await;

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());

                    return Some(key);
                }

                if state.shutdown {
                    return None;
                }

                notified.as_mut().enable();
            }

            notified.await;
        }
    }

    /// Marks the key as no longer processed, queueing it again if it was
    /// added in the meantime.
    pub async fn done(&self, key: &WorkKey) {
        let mut state = self.state.lock().await;

        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Counts a failed attempt, returns the number of attempts so far.
    pub async fn record_failure(&self, key: &WorkKey) -> u32 {
        let mut state = self.state.lock().await;
        let failures = state.failures.entry(key.clone()).or_default();

        *failures += 1;
        *failures
    }

    pub async fn failures(&self, key: &WorkKey) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub async fn forget(&self, key: &WorkKey) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }
}

impl Display for WorkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKey::Subnet(name) => f.write_fmt(format_args!("subnet '{name}'")),
            WorkKey::Lease(key) => f.write_fmt(format_args!("lease '{key}'")),
        }
    }
}
