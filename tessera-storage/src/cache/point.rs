//! Batched point lookups.

use std::sync::Arc;

use futures_util::future::{join_all, try_join_all};
use tessera_core::{PointKey, Record, TesseraResult};
use tokio::sync::Notify;
use tracing::debug;

use super::{resolve, Claim, Slots};
use crate::driver::StorageDriver;

/// Coalesces point loads into batched driver reads of at most
/// [`StorageDriver::max_batch_size`] keys.
pub struct PointCache {
    driver: Arc<dyn StorageDriver>,
    slots: Slots<PointKey, Option<Record>>,
    wake: Arc<Notify>,
}

impl PointCache {
    pub fn new(driver: Arc<dyn StorageDriver>, wake: Arc<Notify>) -> Self {
        Self {
            driver,
            slots: Slots::new(),
            wake,
        }
    }

    pub async fn load(&self, key: PointKey) -> TesseraResult<Option<Record>> {
        match self.slots.claim(&key) {
            Claim::Ready(record) => Ok(record),
            Claim::Joined(receiver) => resolve(receiver).await,
            Claim::Queued(receiver) => {
                self.wake.notify_one();
                resolve(receiver).await
            }
        }
    }

    /// Ordered multi-load; missing records are `None`.
    pub async fn load_many(&self, keys: Vec<PointKey>) -> TesseraResult<Vec<Option<Record>>> {
        try_join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    pub fn clear(&self, key: &PointKey) {
        self.slots.clear(key);
    }

    pub fn has_pending(&self) -> bool {
        self.slots.has_pending()
    }

    /// Send every queued key to the driver. Returns the number of keys
    /// dispatched.
    pub async fn dispatch(&self) -> usize {
        let queue = self.slots.take_queue();
        if queue.is_empty() {
            return 0;
        }
        let batch_size = self.driver.max_batch_size().max(1);
        let batches = queue.chunks(batch_size).map(|batch| async move {
            let keys: Vec<PointKey> = batch.iter().map(|(key, _)| key.clone()).collect();
            match self.driver.get(&keys).await {
                Ok(records) => {
                    for ((key, pending), record) in batch.iter().zip(records) {
                        self.slots.settle(key.clone(), pending, Ok(record));
                    }
                }
                Err(e) => {
                    for (key, pending) in batch {
                        self.slots.settle(key.clone(), pending, Err(e.clone()));
                    }
                }
            }
        });
        join_all(batches).await;
        debug!(keys = queue.len(), batch_size, "Dispatched point loads");
        queue.len()
    }
}
