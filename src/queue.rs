//! The per-cluster work queue (§4.2, §5). FIFO by insertion order, deduplicated
//! by key while an item is queued or in flight, with rate-limited (exponential
//! backoff) re-enqueue and a per-key requeue counter the reconciler consults
//! against `requeueLimit`.
//!
//! The coalescing algorithm mirrors the classic `client-go` workqueue: a `dirty`
//! set tracks "wants to run", a `processing` set tracks "currently running", and
//! `Add` during processing only marks the key dirty again rather than queueing
//! a second time -- `Done` notices the dirty mark and requeues once the worker
//! finishes. Because our items carry a full event payload rather than being
//! their own key, the latest payload for a coalesced key always wins: a worker
//! that dequeues a key always sees the freshest state observed for it.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Duration,
};

use tokio::sync::Notify;

use crate::events::DomainEvent;

const BASE_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Inner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    items: HashMap<String, DomainEvent>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

/// A rate-limited, deduplicating FIFO queue of [`DomainEvent`]s. Single
/// consumer; producers (informer callbacks, the repair timer, `Stop`) may come
/// from any number of tasks.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                items: HashMap::new(),
                requeues: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues immediately, coalescing with any identically-keyed item already
    /// queued or in flight.
    pub fn add(&self, event: DomainEvent) {
        let key = event.queue_key();
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");

        inner.items.insert(key.clone(), event);

        if inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());

        if inner.processing.contains(&key) {
            return;
        }

        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues after an exponential backoff delay keyed by the item's current
    /// requeue count, and bumps that count. Spawns a detached timer task; the
    /// queue's own dedup logic makes a stray fire after `forget` harmless in
    /// practice because by then nothing is re-driving that key's retries.
    pub fn add_rate_limited(self: &std::sync::Arc<Self>, event: DomainEvent) {
        let key = event.queue_key();
        let attempt = {
            let mut inner = self.inner.lock().expect("work queue mutex poisoned");
            let counter = inner.requeues.entry(key.clone()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };

        let delay = backoff_for(attempt);
        let this = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.add(event);
        });
    }

    /// Blocks until an item is available or the queue has shut down and
    /// drained. Marks the key as processing and clears its dirty bit.
    pub async fn get(&self) -> Option<DomainEvent> {
        loop {
            {
                let mut inner = self.inner.lock().expect("work queue mutex poisoned");
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let item = inner.items.get(&key).cloned();
                    drop(inner);
                    if let Some(item) = item {
                        return Some(item);
                    }
                    continue;
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases `event`'s key from the processing set. If it was re-added while
    /// in flight, it goes back to the tail of the queue now.
    pub fn done(&self, event: &DomainEvent) {
        let key = event.queue_key();
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.processing.remove(&key);

        if inner.dirty.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Clears the requeue counter for `event`'s key -- called once a handler
    /// succeeds, or once the requeue limit is hit and the reconciler gives up.
    pub fn forget(&self, event: &DomainEvent) {
        let key = event.queue_key();
        self.inner
            .lock()
            .expect("work queue mutex poisoned")
            .requeues
            .remove(&key);
    }

    pub fn num_requeues(&self, event: &DomainEvent) -> u32 {
        let key = event.queue_key();
        *self
            .inner
            .lock()
            .expect("work queue mutex poisoned")
            .requeues
            .get(&key)
            .unwrap_or(&0)
    }

    /// Signals shutdown. Already-queued items keep draining; `get` starts
    /// returning `None` once the queue is empty.
    pub fn shut_down(&self) {
        self.inner
            .lock()
            .expect("work queue mutex poisoned")
            .shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().expect("work queue mutex poisoned").shutting_down
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("work queue mutex poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    exp.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::api::core::v1::Service;

    use super::*;

    fn svc(ns: &str, name: &str) -> DomainEvent {
        DomainEvent::OnAddCalled(Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = WorkQueue::new();
        q.add(svc("app", "a"));
        q.add(svc("app", "b"));

        let first = q.get().await.unwrap();
        assert_eq!(first.queue_key(), svc("app", "a").queue_key());
        q.done(&first);

        let second = q.get().await.unwrap();
        assert_eq!(second.queue_key(), svc("app", "b").queue_key());
    }

    #[tokio::test]
    async fn coalesces_while_queued() {
        let q = WorkQueue::new();
        q.add(svc("app", "a"));
        q.add(svc("app", "a"));

        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn coalesces_while_processing_and_requeues_on_done() {
        let q = WorkQueue::new();
        q.add(svc("app", "a"));

        let item = q.get().await.unwrap();
        assert!(q.is_empty());

        q.add(svc("app", "a"));
        assert!(q.is_empty(), "re-add while processing must not double-queue");

        q.done(&item);
        assert_eq!(q.len(), 1, "done() must requeue the dirty key");
    }

    #[tokio::test]
    async fn forget_clears_requeue_counter() {
        let q = Arc::new(WorkQueue::new());
        let event = svc("app", "a");

        q.add_rate_limited(event.clone());
        assert_eq!(q.num_requeues(&event), 1);

        q.forget(&event);
        assert_eq!(q.num_requeues(&event), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = WorkQueue::new();
        q.add(svc("app", "a"));
        q.shut_down();

        assert!(q.get().await.is_some(), "queued item must still drain");
        assert!(q.get().await.is_none(), "empty + shutdown must return None");
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_for(0) < backoff_for(5));
        assert_eq!(backoff_for(40), MAX_BACKOFF);
    }
}
