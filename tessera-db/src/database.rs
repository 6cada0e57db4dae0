//! Tenant-scoped database façade.
//!
//! A [`Database`] is one unit of work for one tenant: it owns a fresh
//! request cache, so reads inside it are batched and memoised, and it is
//! driven by [`Database::start`] or [`Database::scope`]. Typed entities go
//! in and out; the storage driver only ever sees untyped records.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    validate_organisation, Entity, PointKey, QueryKey, QueryShape, Record, RecordRef,
    TesseraError, TesseraResult, WriteRecord,
};
use tessera_storage::{Dispatcher, PointCache, QueryCache, StorageDriver};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::auth::{ensure_allowed, AuthorizationRequest, WriteAction, WriteAuthorizer};

pub struct Database {
    organisation_id: String,
    driver: Arc<dyn StorageDriver>,
    authorizer: Arc<dyn WriteAuthorizer>,
    points: Arc<PointCache>,
    queries: Arc<QueryCache>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("organisation_id", &self.organisation_id)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(
        organisation_id: impl Into<String>,
        driver: Arc<dyn StorageDriver>,
        authorizer: Arc<dyn WriteAuthorizer>,
        flush_interval: Duration,
    ) -> TesseraResult<Self> {
        let organisation_id = organisation_id.into();
        validate_organisation(&organisation_id)?;
        let wake = Arc::new(Notify::new());
        let points = Arc::new(PointCache::new(driver.clone(), wake.clone()));
        let queries = Arc::new(QueryCache::new(driver.clone(), wake.clone()));
        let dispatcher = Dispatcher::new(points.clone(), queries.clone(), wake, flush_interval);
        Ok(Self {
            organisation_id,
            driver,
            authorizer,
            points,
            queries,
            dispatcher,
        })
    }

    pub fn organisation_id(&self) -> &str {
        &self.organisation_id
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Drive the request cache until `done` resolves.
    ///
    /// Reads issued through this database only make progress while this
    /// future is being polled.
    pub async fn start<F>(&self, done: F)
    where
        F: Future<Output = ()>,
    {
        self.dispatcher.run(done).await;
    }

    /// Run `work` with the dispatcher alongside it, stopping the dispatcher
    /// once `work` completes.
    pub async fn scope<F, R>(&self, work: F) -> R
    where
        F: Future<Output = R>,
    {
        let (stop, stopped) = oneshot::channel::<()>();
        let body = async move {
            let output = work.await;
            let _ = stop.send(());
            output
        };
        let done = async move {
            let _ = stopped.await;
        };
        let (output, ()) = tokio::join!(body, self.start(done));
        output
    }

    // ========================================================================
    // READS
    // ========================================================================

    fn point(&self, type_name: &str, id: &str) -> PointKey {
        PointKey::new(&self.organisation_id, type_name, id)
    }

    /// Point lookup; `None` when missing or deleted in every visible tier.
    pub async fn get<T: Entity>(&self, id: &str) -> TesseraResult<Option<T>> {
        self.points
            .load(self.point(T::TYPE, id))
            .await?
            .map(Record::into_entity)
            .transpose()
    }

    /// [`Database::get`] for an id that may itself be absent.
    pub async fn get_optional<T: Entity>(&self, id: Option<&str>) -> TesseraResult<Option<T>> {
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Ordered multi-get; missing entries are `None`.
    pub async fn get_many<T, I>(&self, ids: I) -> TesseraResult<Vec<Option<T>>>
    where
        T: Entity,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let keys = ids
            .into_iter()
            .map(|id| self.point(T::TYPE, id.as_ref()))
            .collect();
        self.points
            .load_many(keys)
            .await?
            .into_iter()
            .map(|record| record.map(Record::into_entity).transpose())
            .collect()
    }

    /// Prefix scan across every tier of this tenant plus the global tenant.
    pub async fn query<T: Entity>(&self, shape: QueryShape) -> TesseraResult<Vec<T>> {
        self.queries
            .load(QueryKey::new(&self.organisation_id, T::TYPE, shape))
            .await?
            .into_iter()
            .map(Record::into_entity)
            .collect()
    }

    /// Records of every tenant whose global index value is `value`.
    pub async fn query_global<T: Entity>(&self, value: &str) -> TesseraResult<Vec<T>> {
        self.driver
            .query_global(T::TYPE, value)
            .await?
            .into_iter()
            .map(Record::into_entity)
            .collect()
    }

    pub async fn query_global_unique<T: Entity>(&self, value: &str) -> TesseraResult<Option<T>> {
        unique(value, self.query_global(value).await?)
    }

    /// Records of this tenant whose secondary index value is `value`.
    pub async fn query_secondary<T: Entity>(&self, value: &str) -> TesseraResult<Vec<T>> {
        self.driver
            .query_secondary(&self.organisation_id, T::TYPE, value)
            .await?
            .into_iter()
            .map(Record::into_entity)
            .collect()
    }

    pub async fn query_secondary_unique<T: Entity>(
        &self,
        value: &str,
    ) -> TesseraResult<Option<T>> {
        unique(value, self.query_secondary(value).await?)
    }

    /// Resolve the records `entity` already links to under `U`'s type.
    pub async fn get_links<T: Entity, U: Entity>(&self, entity: &T) -> TesseraResult<Vec<U>> {
        let ids = entity.links().ids(U::TYPE);
        Ok(self.get_many::<U, _>(&ids).await?.into_iter().flatten().collect())
    }

    /// Singular [`Database::get_links`]; more than one link is an error.
    pub async fn get_link<T: Entity, U: Entity>(&self, entity: &T) -> TesseraResult<Option<U>> {
        let lookup = format!("{}.links.{}", T::TYPE, U::TYPE);
        unique(&lookup, self.get_links::<T, U>(entity).await?)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    fn invalidate(&self, type_name: &str, id: &str) {
        self.points.clear(&self.point(type_name, id));
        self.points
            .clear(&PointKey::new(self.driver.global_organisation(), type_name, id));
    }

    async fn write<T: Entity>(
        &self,
        organisation_id: &str,
        entity: &T,
        check: bool,
    ) -> TesseraResult<T> {
        let record: WriteRecord = self.driver.registry().write_record(entity)?;
        ensure_allowed(
            self.authorizer.as_ref(),
            AuthorizationRequest {
                organisation_id: organisation_id.to_string(),
                type_name: T::TYPE.to_string(),
                id: record.id.clone(),
                action: WriteAction::Put,
                payload: Some(record.item.clone()),
            },
        )
        .await?;

        if let Some(id) = &record.id {
            self.invalidate(T::TYPE, id);
        }
        self.queries.clear_type(T::TYPE);

        let stored = self.driver.put(organisation_id, record, check).await?;
        Ok(WriteRecord::stamp_onto(entity, &stored))
    }

    /// Checked put: fails with a concurrency error unless the stored revision
    /// still equals the one `entity` holds.
    pub async fn put<T: Entity>(&self, entity: &T) -> TesseraResult<T> {
        let organisation_id = self.organisation_id.clone();
        self.write(&organisation_id, entity, true).await
    }

    /// Unchecked put: overwrites and advances from whatever is stored.
    pub async fn put_unchecked<T: Entity>(&self, entity: &T) -> TesseraResult<T> {
        let organisation_id = self.organisation_id.clone();
        self.write(&organisation_id, entity, false).await
    }

    /// Checked put under the global tenant, readable by every tenant.
    pub async fn put_global<T: Entity>(&self, entity: &T) -> TesseraResult<T> {
        let organisation_id = self.driver.global_organisation().to_string();
        self.write(&organisation_id, entity, true).await
    }

    /// Delete `entity`. Returns `false` when there was nothing this tenant
    /// may delete: the entity was never stored, or it belongs to another
    /// tenant.
    ///
    /// An entity with outgoing links fails with
    /// [`TesseraError::DanglingLinks`] unless `cascade` is set, in which case
    /// every relation is cleared first.
    pub async fn delete<T: Entity>(&self, entity: &T, cascade: bool) -> TesseraResult<bool> {
        let record = RecordRef::of(entity)?;
        ensure_allowed(
            self.authorizer.as_ref(),
            AuthorizationRequest {
                organisation_id: self.organisation_id.clone(),
                type_name: T::TYPE.to_string(),
                id: Some(record.id.clone()),
                action: WriteAction::Delete,
                payload: None,
            },
        )
        .await?;

        self.invalidate(T::TYPE, &record.id);
        self.queries.clear_type(T::TYPE);
        if cascade {
            for (type_name, ids) in record.links.iter() {
                for id in ids {
                    self.invalidate(type_name, id);
                }
                self.queries.clear_type(type_name);
            }
        }

        let deleted = self
            .driver
            .delete(&self.organisation_id, &record, cascade)
            .await?;
        debug!(entity_type = T::TYPE, id = %record.id, deleted, "Delete dispatched");
        Ok(deleted)
    }

    /// Reconcile `entity`'s `target_type` relation to exactly `ids`. An empty
    /// set clears the relation. Returns `entity` with its new revision and
    /// link snapshot.
    pub async fn link<T, I>(&self, entity: &T, target_type: &str, ids: I) -> TesseraResult<T>
    where
        T: Entity,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let record = RecordRef::of(entity)?;
        let desired: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        ensure_allowed(
            self.authorizer.as_ref(),
            AuthorizationRequest {
                organisation_id: self.organisation_id.clone(),
                type_name: T::TYPE.to_string(),
                id: Some(record.id.clone()),
                action: WriteAction::Link,
                payload: None,
            },
        )
        .await?;

        let diff = record.links.diff(target_type, &desired);
        self.invalidate(T::TYPE, &record.id);
        for id in diff.touched() {
            self.invalidate(target_type, id);
        }
        self.queries.clear_type(T::TYPE);
        self.queries.clear_type(target_type);

        let outcome = self
            .driver
            .link(&self.organisation_id, &record, target_type, &desired)
            .await?;
        let mut linked = entity.clone();
        linked
            .meta_mut()
            .apply_link(outcome.revision, outcome.updated_at, outcome.links);
        Ok(linked)
    }

    /// Single-target [`Database::link`]; `None` clears the relation.
    pub async fn link_one<T: Entity>(
        &self,
        entity: &T,
        target_type: &str,
        id: Option<&str>,
    ) -> TesseraResult<T> {
        self.link(entity, target_type, id.map(str::to_string)).await
    }
}

fn unique<T: Entity>(lookup: &str, mut found: Vec<T>) -> TesseraResult<Option<T>> {
    match found.len() {
        0 | 1 => Ok(found.pop()),
        count => Err(TesseraError::Multiplicity {
            type_name: T::TYPE.to_string(),
            lookup: lookup.to_string(),
            count,
        }),
    }
}
