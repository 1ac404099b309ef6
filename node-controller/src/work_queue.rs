use crate::{
    rate_limiter::{BackoffSettings, RateLimiter, Requeue},
    resource_key::ResourceKey,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, Notify},
    time::sleep,
};

/// The notification kind which caused a [`WorkItem`] to be enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Operation {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Add => write!(f, "add"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A key pending reconciliation.
#[derive(Debug)]
pub(crate) struct WorkItem<K> {
    pub key: ResourceKey,
    pub operation: Operation,
    /// State before the notification, only kept for updates and deletes.
    pub prior: Option<Arc<K>>,
}

impl<K> Clone for WorkItem<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            operation: self.operation,
            prior: self.prior.clone(),
        }
    }
}

impl<K> WorkItem<K> {
    pub fn new(key: ResourceKey, operation: Operation, prior: Option<Arc<K>>) -> Self {
        Self {
            key,
            operation,
            prior,
        }
    }

    /// Collapse a newer notification for the same key into this pending item.
    ///
    /// A pending `Add` stays an `Add` so that first-seen objects are still adopted,
    /// otherwise the newer operation wins. The oldest prior snapshot is kept,
    /// unless the merged item is an `Add` which never carries one.
    fn merge(self, newer: WorkItem<K>) -> Self {
        let operation = match (self.operation, newer.operation) {
            (Operation::Add, Operation::Update) => Operation::Add,
            (_, newer) => newer,
        };
        let prior = match operation {
            Operation::Add => None,
            _ => self.prior.or(newer.prior),
        };
        Self {
            key: self.key,
            operation,
            prior,
        }
    }
}

struct QueueState<K> {
    /// Keys ready for dispatch in FIFO order.
    queue: VecDeque<ResourceKey>,
    /// The pending item of every queued key and of in-flight keys re-notified
    /// while being processed.
    dirty: HashMap<ResourceKey, WorkItem<K>>,
    /// Keys currently handled by a worker.
    processing: HashSet<ResourceKey>,
    rate_limiter: RateLimiter,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

/// Deduplicating, rate limited work queue which hands out every key to at most
/// one worker at a time.
pub(crate) struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Send + Sync + 'static,
{
    pub fn new(backoff: BackoffSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: Default::default(),
                    dirty: Default::default(),
                    processing: Default::default(),
                    rate_limiter: RateLimiter::new(backoff),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub async fn add(&self, item: WorkItem<K>) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }
        let key = item.key.clone();
        if let Some(pending) = state.dirty.remove(&key) {
            // Already queued, or parked until the in-flight item is done.
            state.dirty.insert(key, pending.merge(item));
            return;
        }
        state.dirty.insert(key.clone(), item);
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            self.inner.notify.notify_one();
        }
    }

    /// Blocks until an item is available, returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<WorkItem<K>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.queue.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        if !state.queue.is_empty() {
                            // Hand the remaining items to the next idle worker.
                            self.inner.notify.notify_one();
                        }
                        return Some(item);
                    }
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as no longer in flight, re-queues a notification which
    /// arrived in the meantime.
    pub async fn done(&self, key: &ResourceKey) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if !state.shutting_down && state.dirty.contains_key(key) {
            state.queue.push_back(key.clone());
            self.inner.notify.notify_one();
        }
    }

    pub async fn add_after(&self, item: WorkItem<K>, delay: Duration) {
        if delay.is_zero() {
            return self.add(item).await;
        }
        if self.inner.state.lock().await.shutting_down {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(item).await;
        });
    }

    /// Re-enqueue a failed item after its backoff delay, or drop it once its
    /// retries are exhausted.
    pub async fn add_rate_limited(&self, item: WorkItem<K>) -> Requeue {
        let requeue = self.inner.state.lock().await.rate_limiter.when(&item.key);
        if let Requeue::After(delay) = requeue {
            self.add_after(item, delay).await;
        }
        requeue
    }

    pub async fn forget(&self, key: &ResourceKey) {
        self.inner.state.lock().await.rate_limiter.forget(key);
    }

    pub async fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.inner.state.lock().await.rate_limiter.num_requeues(key)
    }

    /// Number of keys waiting for dispatch.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Stops dispatching, wakes up all waiting workers. Workers finish their
    /// current item.
    pub async fn shut_down(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}
