//! Cached prefix scans. Scans never coalesce, so each queued key is its own
//! driver call.

use std::sync::Arc;

use futures_util::future::join_all;
use tessera_core::{QueryKey, Record, TesseraResult};
use tokio::sync::Notify;
use tracing::debug;

use super::{resolve, Claim, Slots};
use crate::driver::StorageDriver;

pub struct QueryCache {
    driver: Arc<dyn StorageDriver>,
    slots: Slots<QueryKey, Vec<Record>>,
    wake: Arc<Notify>,
}

impl QueryCache {
    pub fn new(driver: Arc<dyn StorageDriver>, wake: Arc<Notify>) -> Self {
        Self {
            driver,
            slots: Slots::new(),
            wake,
        }
    }

    pub async fn load(&self, key: QueryKey) -> TesseraResult<Vec<Record>> {
        match self.slots.claim(&key) {
            Claim::Ready(records) => Ok(records),
            Claim::Joined(receiver) => resolve(receiver).await,
            Claim::Queued(receiver) => {
                self.wake.notify_one();
                resolve(receiver).await
            }
        }
    }

    pub fn clear(&self, key: &QueryKey) {
        self.slots.clear(key);
    }

    /// Drop every cached scan of `type_name`, whatever its shape or tenant.
    pub fn clear_type(&self, type_name: &str) {
        self.slots.retain(|key| key.type_name != type_name);
    }

    pub fn has_pending(&self) -> bool {
        self.slots.has_pending()
    }

    pub async fn dispatch(&self) -> usize {
        let queue = self.slots.take_queue();
        if queue.is_empty() {
            return 0;
        }
        join_all(queue.iter().map(|(key, pending)| async move {
            let result = self.driver.query(key).await;
            self.slots.settle(key.clone(), pending, result);
        }))
        .await;
        debug!(queries = queue.len(), "Dispatched queries");
        queue.len()
    }
}
