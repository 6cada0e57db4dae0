//! The loop that drives the request caches.
//!
//! Loads only queue work; nothing reaches the driver until a flush. The
//! dispatcher flushes both caches whenever either has queued work and
//! otherwise idles until a load is queued, the flush interval passes, or the
//! caller's completion signal resolves.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{PointCache, QueryCache};

pub struct Dispatcher {
    points: Arc<PointCache>,
    queries: Arc<QueryCache>,
    wake: Arc<Notify>,
    interval: Duration,
}

impl Dispatcher {
    /// `wake` must be the [`Notify`] both caches were built with.
    pub fn new(
        points: Arc<PointCache>,
        queries: Arc<QueryCache>,
        wake: Arc<Notify>,
        interval: Duration,
    ) -> Self {
        Self {
            points,
            queries,
            wake,
            interval,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.points.has_pending() || self.queries.has_pending()
    }

    /// Dispatch both caches' queues concurrently.
    pub async fn flush(&self) -> usize {
        let (points, queries) = join(self.points.dispatch(), self.queries.dispatch()).await;
        points + queries
    }

    /// Run until `done` resolves, then drain whatever is still queued.
    pub async fn run<F>(&self, done: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(done);
        let mut rounds = 0usize;
        loop {
            if done.as_mut().now_or_never().is_some() {
                break;
            }
            if self.has_pending() {
                rounds += 1;
                let dispatched = self.flush().await;
                trace!(round = rounds, dispatched, "Flushed request caches");
                continue;
            }
            tokio::select! {
                _ = &mut done => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        let drained = self.flush().await;
        debug!(rounds, drained, "Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{StorageDriver, TieredDriver};
    use crate::kv::MemoryKvStore;
    use serde::{Deserialize, Serialize};
    use tessera_core::{
        EngineConfig, Entity, EntityMeta, PointKey, QueryKey, QueryShape, TypeRegistry,
    };
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        #[serde(skip)]
        meta: EntityMeta,
        n: u32,
    }

    impl Entity for Widget {
        const TYPE: &'static str = "widget";
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    struct Harness {
        driver: Arc<TieredDriver<MemoryKvStore>>,
        points: Arc<PointCache>,
        queries: Arc<QueryCache>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let mut registry = TypeRegistry::new();
        registry.register::<Widget>();
        let driver = Arc::new(
            TieredDriver::new(
                Arc::new(MemoryKvStore::new()),
                EngineConfig::single("prod").with_max_batch_items(4),
                Arc::new(registry),
            )
            .unwrap(),
        );
        let wake = Arc::new(Notify::new());
        let shared: Arc<dyn StorageDriver> = driver.clone();
        let points = Arc::new(PointCache::new(shared.clone(), wake.clone()));
        let queries = Arc::new(QueryCache::new(shared, wake.clone()));
        let dispatcher = Dispatcher::new(
            points.clone(),
            queries.clone(),
            wake,
            Duration::from_millis(2),
        );
        Harness {
            driver,
            points,
            queries,
            dispatcher,
        }
    }

    async fn seed(driver: &TieredDriver<MemoryKvStore>, n: u32) {
        for i in 0..n {
            let widget = Widget {
                meta: EntityMeta::with_id(format!("w{i}")),
                n: i,
            };
            let write = driver.registry().write_record(&widget).unwrap();
            driver.put("acme", write, true).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_loads_resolve_under_the_dispatcher() {
        let h = harness();
        seed(&h.driver, 5).await;
        let (stop, done) = oneshot::channel::<()>();

        let work = async {
            let keys = (0..6).map(|i| PointKey::new("acme", "widget", format!("w{i}"))).collect();
            let records = h.points.load_many(keys).await.unwrap();
            let scan = h
                .queries
                .load(QueryKey::new("acme", "widget", QueryShape::all()))
                .await
                .unwrap();
            let _ = stop.send(());
            (records, scan)
        };
        let ((records, scan), ()) = tokio::join!(work, h.dispatcher.run(async {
            let _ = done.await;
        }));

        assert_eq!(records.len(), 6);
        assert!(records[..5].iter().all(Option::is_some));
        assert!(records[5].is_none());
        assert_eq!(scan.len(), 5);
    }

    #[tokio::test]
    async fn test_cached_values_survive_until_cleared() {
        let h = harness();
        seed(&h.driver, 1).await;
        let key = PointKey::new("acme", "widget", "w0");

        let first = {
            let load = h.points.load(key.clone());
            let (record, _) = tokio::join!(load, h.dispatcher.flush());
            record.unwrap().unwrap()
        };

        // Written behind the cache's back; the cached copy is still served.
        let write = h
            .driver
            .registry()
            .write_record(&first.clone().into_entity::<Widget>().unwrap())
            .unwrap();
        h.driver.put("acme", write, true).await.unwrap();
        let cached = h.points.load(key.clone()).await.unwrap().unwrap();
        assert_eq!(cached.revision, 1);

        h.points.clear(&key);
        let (fresh, _) = tokio::join!(h.points.load(key.clone()), h.dispatcher.flush());
        assert_eq!(fresh.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_done_already_resolved() {
        let h = harness();
        h.dispatcher.run(async {}).await;
        assert!(!h.dispatcher.has_pending());
    }
}
