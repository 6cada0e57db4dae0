//! Buffered puts.
//!
//! A [`WriteBuffer`] collects puts across tenants and types and issues them
//! concurrently on [`WriteBuffer::flush`]. Every queued put hands back a
//! [`PendingWrite`] that resolves to the stored entity, or to that put's own
//! error, once the flush has run.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tessera_core::{Entity, Record, StorageError, TesseraResult, WriteRecord};
use tessera_storage::StorageDriver;
use tokio::sync::oneshot;
use tracing::debug;

use crate::auth::{ensure_allowed, AuthorizationRequest, WriteAction, WriteAuthorizer};

struct QueuedWrite {
    organisation_id: String,
    type_name: &'static str,
    record: WriteRecord,
    check: bool,
    reply: oneshot::Sender<TesseraResult<Record>>,
}

pub struct WriteBuffer {
    driver: Arc<dyn StorageDriver>,
    authorizer: Arc<dyn WriteAuthorizer>,
    queued: Mutex<Vec<QueuedWrite>>,
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

impl WriteBuffer {
    pub fn new(driver: Arc<dyn StorageDriver>, authorizer: Arc<dyn WriteAuthorizer>) -> Self {
        Self {
            driver,
            authorizer,
            queued: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a put of `entity` into `organisation_id`.
    ///
    /// Serialization happens here, so an entity the registry cannot encode
    /// is rejected immediately rather than at flush time.
    pub fn put<T: Entity>(
        &self,
        organisation_id: impl Into<String>,
        entity: &T,
        check: bool,
    ) -> TesseraResult<PendingWrite<T>> {
        let record = self.driver.registry().write_record(entity)?;
        let (reply, receiver) = oneshot::channel();
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(QueuedWrite {
                organisation_id: organisation_id.into(),
                type_name: T::TYPE,
                record,
                check,
                reply,
            });
        Ok(PendingWrite {
            entity: entity.clone(),
            receiver,
        })
    }

    /// Issue every queued put concurrently. Returns how many were issued.
    pub async fn flush(&self) -> usize {
        let queued = std::mem::take(
            &mut *self.queued.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = queued.len();
        join_all(queued.into_iter().map(|write| self.issue(write))).await;
        debug!(count, "Write buffer flushed");
        count
    }

    async fn issue(&self, write: QueuedWrite) {
        let QueuedWrite {
            organisation_id,
            type_name,
            record,
            check,
            reply,
        } = write;
        let request = AuthorizationRequest {
            organisation_id: organisation_id.clone(),
            type_name: type_name.to_string(),
            id: record.id.clone(),
            action: WriteAction::Put,
            payload: Some(record.item.clone()),
        };
        let result = match ensure_allowed(self.authorizer.as_ref(), request).await {
            Ok(()) => self.driver.put(&organisation_id, record, check).await,
            Err(err) => Err(err),
        };
        // The caller may have stopped waiting.
        let _ = reply.send(result);
    }
}

/// Handle to a buffered put.
pub struct PendingWrite<T> {
    entity: T,
    receiver: oneshot::Receiver<TesseraResult<Record>>,
}

impl<T: Entity> PendingWrite<T> {
    /// Wait for the flush that issues this put.
    pub async fn wait(self) -> TesseraResult<T> {
        let stored = self.receiver.await.map_err(|_| StorageError::DispatchDropped {
            reason: "write buffer dropped before flushing".to_string(),
        })??;
        Ok(WriteRecord::stamp_onto(&self.entity, &stored))
    }
}
