//! Per-unit-of-work request cache.
//!
//! A load never hits the driver directly. It claims a slot for its key: a
//! ready value is returned at once, an in-flight load is shared, and a new
//! key is queued until the [`Dispatcher`] flushes the queue. Writes clear
//! slots synchronously before they are dispatched, so later reads in the same
//! unit of work see their own writes.
//!
//! # Invalidation while in flight
//!
//! Clearing a key whose load is already dispatched drops the slot but not the
//! sender: current waiters still get the result, it just is not cached. The
//! next load of that key queues a fresh request.

pub mod dispatch;
pub mod point;
pub mod query;

pub use dispatch::Dispatcher;
pub use point::PointCache;
pub use query::QueryCache;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_core::{StorageError, TesseraResult};
use tokio::sync::watch;

type Outcome<V> = Option<TesseraResult<V>>;

/// Sender shared by every waiter of one dispatched or queued load.
pub(crate) type Pending<V> = Arc<watch::Sender<Outcome<V>>>;

enum Slot<V> {
    Waiting(Pending<V>),
    Ready(V),
}

/// What a load gets back when it claims a key.
pub(crate) enum Claim<V> {
    Ready(V),
    /// Shares an existing load.
    Joined(watch::Receiver<Outcome<V>>),
    /// Queued a new load; the dispatcher should be woken.
    Queued(watch::Receiver<Outcome<V>>),
}

struct State<K, V> {
    entries: HashMap<K, Slot<V>>,
    queue: Vec<(K, Pending<V>)>,
}

/// Slot table plus the queue of loads not yet dispatched.
pub(crate) struct Slots<K, V> {
    state: Mutex<State<K, V>>,
}

impl<K, V> Slots<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                queue: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn claim(&self, key: &K) -> Claim<V> {
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(Slot::Ready(value)) => return Claim::Ready(value.clone()),
            Some(Slot::Waiting(pending)) => return Claim::Joined(pending.subscribe()),
            None => {}
        }
        let (sender, receiver) = watch::channel(None);
        let pending = Arc::new(sender);
        state
            .entries
            .insert(key.clone(), Slot::Waiting(Arc::clone(&pending)));
        state.queue.push((key.clone(), pending));
        Claim::Queued(receiver)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.lock().queue.is_empty()
    }

    pub(crate) fn take_queue(&self) -> Vec<(K, Pending<V>)> {
        std::mem::take(&mut self.lock().queue)
    }

    /// Deliver `result` to every waiter of `pending`, caching successes
    /// unless the key was cleared or reclaimed meanwhile.
    pub(crate) fn settle(&self, key: K, pending: &Pending<V>, result: TesseraResult<V>) {
        {
            let mut state = self.lock();
            let current = matches!(
                state.entries.get(&key),
                Some(Slot::Waiting(slot)) if Arc::ptr_eq(slot, pending)
            );
            if current {
                match &result {
                    Ok(value) => {
                        state.entries.insert(key, Slot::Ready(value.clone()));
                    }
                    Err(_) => {
                        state.entries.remove(&key);
                    }
                }
            }
        }
        pending.send_replace(Some(result));
    }

    pub(crate) fn clear(&self, key: &K) {
        self.lock().entries.remove(key);
    }

    pub(crate) fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.lock().entries.retain(|key, _| keep(key));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Wait until the load behind `receiver` settles.
pub(crate) async fn resolve<V: Clone>(mut receiver: watch::Receiver<Outcome<V>>) -> TesseraResult<V> {
    let outcome = receiver
        .wait_for(Option::is_some)
        .await
        .map_err(|_| StorageError::DispatchDropped {
            reason: "request cache dropped before the load was dispatched".to_string(),
        })?
        .clone();
    outcome.unwrap_or_else(|| {
        Err(StorageError::DispatchDropped {
            reason: "load settled without a result".to_string(),
        }
        .into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TesseraError;

    fn receiver(claim: Claim<u32>) -> watch::Receiver<Outcome<u32>> {
        match claim {
            Claim::Joined(rx) | Claim::Queued(rx) => rx,
            Claim::Ready(_) => panic!("unexpected ready slot"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_share_one_load() {
        let slots: Slots<&str, u32> = Slots::new();
        let first = slots.claim(&"a");
        assert!(matches!(first, Claim::Queued(_)));
        let second = slots.claim(&"a");
        assert!(matches!(second, Claim::Joined(_)));

        let queue = slots.take_queue();
        assert_eq!(queue.len(), 1);
        let (key, pending) = &queue[0];
        slots.settle(*key, pending, Ok(7));

        assert_eq!(resolve(receiver(first)).await.unwrap(), 7);
        assert_eq!(resolve(receiver(second)).await.unwrap(), 7);
        assert!(matches!(slots.claim(&"a"), Claim::Ready(7)));
    }

    #[tokio::test]
    async fn test_cleared_in_flight_result_is_delivered_not_cached() {
        let slots: Slots<&str, u32> = Slots::new();
        let waiter = receiver(slots.claim(&"a"));
        let queue = slots.take_queue();

        slots.clear(&"a");
        slots.settle("a", &queue[0].1, Ok(1));

        assert_eq!(resolve(waiter).await.unwrap(), 1);
        assert!(matches!(slots.claim(&"a"), Claim::Queued(_)));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let slots: Slots<&str, u32> = Slots::new();
        let waiter = receiver(slots.claim(&"a"));
        let queue = slots.take_queue();
        slots.settle("a", &queue[0].1, Err(TesseraError::unsupported("widget", "test")));

        assert!(resolve(waiter).await.is_err());
        assert_eq!(slots.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_queue_reports_dispatch_dropped() {
        let slots: Slots<&str, u32> = Slots::new();
        let waiter = receiver(slots.claim(&"a"));
        drop(slots);
        let err = resolve(waiter).await.unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Storage(StorageError::DispatchDropped { .. })
        ));
    }
}
