//! Tiered storage driver.
//!
//! Encodes canonical operations onto the tiered key-value layout. Reads fan
//! out over every tier, for the caller's tenant and the global pseudo-tenant,
//! and merge through [`crate::flatten`]. Writes only ever touch the active
//! (last) tier, guarded by a revision condition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::try_join_all;
use tessera_core::{
    sort_key, validate_organisation, ChangeRecord, ChangeSink, EngineConfig, IdGenerator,
    LinkMap, PointKey, Provenance, QueryKey, RawRecord, Record, RecordRef, StorageError,
    TesseraError, TesseraResult, Timestamp, TypeDescriptor, TypeRegistry, UuidV7Generator,
    ValidationError, WriteRecord,
};
use tracing::{debug, instrument, trace, warn};

use crate::backup::BackupItem;
use crate::codec::{self, attr};
use crate::flatten::{flatten, flatten_all};
use crate::kv::{
    has_payload, stored_revision, Clause, Condition, IndexKind, Item, ItemKey, KvStore,
    ScanRequest, ShardFilter, UpdateAction,
};

/// Result of a link reconciliation on the driving record.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    pub revision: u64,
    pub updated_at: Timestamp,
    /// The caller's snapshot with the relation replaced.
    pub links: LinkMap,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

/// Storage operations consumed by the request cache and the façade.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Logical keys per batched read.
    fn max_batch_size(&self) -> usize;

    fn global_organisation(&self) -> &str;

    fn registry(&self) -> &TypeRegistry;

    /// Climbing point lookup; one entry per key, in order.
    async fn get(&self, keys: &[PointKey]) -> TesseraResult<Vec<Option<Record>>>;

    /// Merged prefix scan, id-sorted.
    async fn query(&self, key: &QueryKey) -> TesseraResult<Vec<Record>>;

    /// Records whose global index value is `value`, across tenants.
    async fn query_global(&self, type_name: &str, value: &str) -> TesseraResult<Vec<Record>>;

    /// Records of `organisation_id` whose secondary index value is `value`.
    async fn query_secondary(
        &self,
        organisation_id: &str,
        type_name: &str,
        value: &str,
    ) -> TesseraResult<Vec<Record>>;

    async fn put(
        &self,
        organisation_id: &str,
        record: WriteRecord,
        check: bool,
    ) -> TesseraResult<Record>;

    /// Returns `false` when the delete was a no-op.
    async fn delete(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        cascade: bool,
    ) -> TesseraResult<bool>;

    async fn link(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        ids: &BTreeSet<String>,
    ) -> TesseraResult<LinkOutcome>;

    async fn take_backup(&self, organisation_id: &str) -> TesseraResult<Vec<BackupItem>>;

    /// Returns the number of items written.
    async fn restore_backup(
        &self,
        organisation_id: &str,
        items: Vec<BackupItem>,
    ) -> TesseraResult<usize>;

    /// Returns the number of items removed.
    async fn destroy_organisation(&self, organisation_id: &str) -> TesseraResult<usize>;
}

/// [`StorageDriver`] over any [`KvStore`].
pub struct TieredDriver<S> {
    pub(crate) store: Arc<S>,
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<TypeRegistry>,
    ids: Arc<dyn IdGenerator>,
    changes: Option<Arc<dyn ChangeSink>>,
}

impl<S: KvStore> TieredDriver<S> {
    pub fn new(
        store: Arc<S>,
        config: EngineConfig,
        registry: Arc<TypeRegistry>,
    ) -> TesseraResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            registry,
            ids: Arc::new(UuidV7Generator),
            changes: None,
        })
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.changes = Some(sink);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn active_tier(&self) -> usize {
        self.config.active_tier()
    }

    pub(crate) fn active_table(&self) -> &str {
        &self.config.tiers[self.active_tier()].table
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = (usize, &str)> {
        self.config
            .tiers
            .iter()
            .enumerate()
            .map(|(tier, c)| (tier, c.table.as_str()))
    }

    /// Tenants whose records are visible to `organisation_id`.
    fn view<'a>(&'a self, organisation_id: &'a str) -> Vec<&'a str> {
        let global = self.config.global_organisation.as_str();
        if organisation_id == global {
            vec![global]
        } else {
            vec![global, organisation_id]
        }
    }

    pub(crate) fn descriptor(&self, type_name: &str) -> TesseraResult<&TypeDescriptor> {
        self.registry.descriptor(type_name)
    }

    pub(crate) fn item_key(
        &self,
        organisation_id: &str,
        type_name: &str,
        id: &str,
    ) -> TesseraResult<ItemKey> {
        Ok(codec::item_key(&self.registry, organisation_id, type_name, id)?)
    }

    pub(crate) fn decode_items(&self, tier: usize, items: &[Item]) -> TesseraResult<Vec<RawRecord>> {
        items
            .iter()
            .map(|item| codec::decode(&self.registry, tier, item).map_err(TesseraError::from))
            .collect()
    }

    /// Precondition for a checked write of a record the caller holds at
    /// `held` with the given provenance.
    ///
    /// A record stored at this exact location is compared by revision. A
    /// record inherited from an ancestor tier or from the global tenant has
    /// no payload here yet, so the first write is a migration: it must find
    /// no payload and nothing newer than what the caller saw.
    pub(crate) fn guard(
        &self,
        organisation_id: &str,
        provenance: Option<&Provenance>,
        held: u64,
    ) -> Condition {
        match provenance {
            Some(p) if p.tier != self.active_tier() || p.organisation_id != organisation_id => {
                Condition::none()
                    .with(Clause::NoPayload)
                    .with(Clause::RevisionAtMost(held))
            }
            _ => Condition::none().with(Clause::RevisionEquals(held)),
        }
    }

    pub(crate) async fn publish(&self, change: ChangeRecord) {
        if let Some(sink) = &self.changes {
            let id = change.id.clone();
            if let Err(e) = sink.publish(change).await {
                warn!(id = %id, error = %e, "Change sink rejected record");
            }
        }
    }

    /// Every page of one partition's prefix scan.
    async fn scan_partition(
        &self,
        table: &str,
        partition: String,
        prefix: String,
        after: Option<String>,
        shard: Option<ShardFilter>,
    ) -> TesseraResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut cursor = after;
        loop {
            let page = self
                .store
                .query(
                    table,
                    ScanRequest {
                        partition: partition.clone(),
                        prefix: prefix.clone(),
                        after: cursor,
                        limit: self.config.scan_page_size,
                        shard,
                    },
                )
                .await?;
            trace!(table, partition = %partition, count = page.items.len(), "Scanned page");
            items.extend(page.items);
            match page.last_evaluated {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }

    /// Whether anything other than the caller's active-tier item would
    /// surface once that item is gone.
    async fn visible_elsewhere(
        &self,
        organisation_id: &str,
        type_name: &str,
        id: &str,
    ) -> TesseraResult<bool> {
        let active = self.active_tier();
        for (tier, table) in self.tables() {
            let keys = self
                .view(organisation_id)
                .into_iter()
                .filter(|org| tier != active || *org != organisation_id)
                .map(|org| self.item_key(org, type_name, id))
                .collect::<TesseraResult<Vec<_>>>()?;
            if keys.is_empty() {
                continue;
            }
            let items = self.store.batch_get(table, &keys).await?;
            if items.iter().any(|item| has_payload(Some(item))) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn index_lookup(
        &self,
        kind: IndexKind,
        organisation_id: &str,
        type_name: &str,
        value: &str,
    ) -> TesseraResult<Vec<Record>> {
        let descriptor = self.descriptor(type_name)?;
        let declared = match kind {
            IndexKind::Global => descriptor.has_global(),
            IndexKind::Organisation => descriptor.has_secondary(),
        };
        if !declared {
            return Err(ValidationError::InvalidValue {
                field: kind.attribute().to_string(),
                reason: format!("{type_name} declares no such index"),
            }
            .into());
        }

        let tagged = format!("{type_name}:{value}");
        let scope = match kind {
            IndexKind::Global => None,
            IndexKind::Organisation => Some(organisation_id),
        };
        let hits = try_join_all(self.tables().map(|(tier, table)| {
            let tagged = tagged.as_str();
            async move {
                let items = self.store.query_index(table, kind, tagged, scope).await?;
                self.decode_items(tier, &items)
            }
        }))
        .await?;

        let mut points: Vec<PointKey> = hits
            .into_iter()
            .flatten()
            .filter(|raw| raw.type_name == type_name)
            .map(|raw| {
                let owner = match kind {
                    IndexKind::Global => raw.organisation_id,
                    IndexKind::Organisation => organisation_id.to_string(),
                };
                PointKey::new(owner, type_name, raw.id)
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        points.sort_by(|a, b| a.id.cmp(&b.id).then(a.organisation_id.cmp(&b.organisation_id)));

        // Re-read through the climbing view; a descendant override of the
        // indexed field must hide the ancestor's stale hit.
        let records = StorageDriver::get(self, &points).await?;
        Ok(records
            .into_iter()
            .flatten()
            .filter(|record| {
                let current = match kind {
                    IndexKind::Global => &record.indexes.global,
                    IndexKind::Organisation => &record.indexes.secondary,
                };
                current.as_deref() == Some(tagged.as_str())
            })
            .collect())
    }
}

/// Map a failed guarded write to the caller-facing error.
pub(crate) fn revision_conflict(
    type_name: &str,
    id: &str,
    held: u64,
    err: StorageError,
) -> TesseraError {
    match err {
        StorageError::ConditionFailed { current, .. } => TesseraError::Concurrency {
            type_name: type_name.to_string(),
            id: id.to_string(),
            expected: held,
            actual: stored_revision(current.as_ref()),
        },
        other => TesseraError::Storage(other),
    }
}

#[async_trait]
impl<S: KvStore> StorageDriver for TieredDriver<S> {
    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size()
    }

    fn global_organisation(&self) -> &str {
        &self.config.global_organisation
    }

    fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(keys = keys.len()))]
    async fn get(&self, keys: &[PointKey]) -> TesseraResult<Vec<Option<Record>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut physical = BTreeSet::new();
        for key in keys {
            validate_organisation(&key.organisation_id)?;
            self.descriptor(&key.type_name)?;
            for org in self.view(&key.organisation_id) {
                physical.insert(self.item_key(org, &key.type_name, &key.id)?);
            }
        }
        let physical: Vec<ItemKey> = physical.into_iter().collect();

        let mut reads = Vec::new();
        for (tier, table) in self.tables() {
            for chunk in physical.chunks(self.config.max_batch_items) {
                reads.push(async move {
                    let items = self.store.batch_get(table, chunk).await?;
                    self.decode_items(tier, &items)
                });
            }
        }
        let raws = try_join_all(reads).await?;

        let mut grouped: HashMap<(String, String, String), Vec<RawRecord>> = HashMap::new();
        for raw in raws.into_iter().flatten() {
            grouped
                .entry((raw.organisation_id.clone(), raw.type_name.clone(), raw.id.clone()))
                .or_default()
                .push(raw);
        }

        let global = self.global_organisation();
        let merged = keys
            .iter()
            .map(|key| {
                let group: Vec<RawRecord> = self
                    .view(&key.organisation_id)
                    .into_iter()
                    .filter_map(|org| {
                        grouped.get(&(org.to_string(), key.type_name.clone(), key.id.clone()))
                    })
                    .flatten()
                    .cloned()
                    .collect();
                flatten(group, global)
            })
            .collect();
        debug!(keys = keys.len(), probes = physical.len(), "Batched get");
        Ok(merged)
    }

    #[instrument(skip_all, fields(organisation_id = %key.organisation_id, entity_type = %key.type_name))]
    async fn query(&self, key: &QueryKey) -> TesseraResult<Vec<Record>> {
        validate_organisation(&key.organisation_id)?;
        let descriptor = self.descriptor(&key.type_name)?;
        let shape = &key.shape;
        let type_name = key.type_name.as_str();

        let shards: Vec<Option<ShardFilter>> = match &shape.parallel {
            Some(parallel) => {
                if descriptor.parallel_key() != Some(parallel.grouping_key.as_str()) {
                    return Err(ValidationError::InvalidValue {
                        field: "parallel.grouping_key".to_string(),
                        reason: format!(
                            "{type_name} declares {:?}, not {}",
                            descriptor.parallel_key(),
                            parallel.grouping_key
                        ),
                    }
                    .into());
                }
                if parallel.shard_count == 0 {
                    return Err(ValidationError::InvalidValue {
                        field: "parallel.shard_count".to_string(),
                        reason: "must be positive".to_string(),
                    }
                    .into());
                }
                (0..parallel.shard_count)
                    .map(|shard| {
                        Some(ShardFilter {
                            shard,
                            count: parallel.shard_count,
                        })
                    })
                    .collect()
            }
            None => vec![None],
        };

        // (hash suffix, physical sort prefix, physical cursor)
        let targets: Vec<(Option<String>, String, Option<String>)> = match descriptor.locator() {
            Some(locator) => {
                let expanded = if shape.is_unfiltered() {
                    None
                } else {
                    locator.expand(shape.prefix())
                };
                let Some(expanded) = expanded else {
                    return Err(TesseraError::unsupported(
                        type_name,
                        "hashed types need a prefix that resolves to known partitions",
                    ));
                };
                expanded
                    .into_iter()
                    .map(|l| (Some(l.hash_part), sort_key(type_name, &l.sort_part), None))
                    .collect()
            }
            None => vec![(
                None,
                sort_key(type_name, shape.prefix()),
                shape.after.as_deref().map(|a| sort_key(type_name, a)),
            )],
        };

        let mut scans = Vec::new();
        for org in self.view(&key.organisation_id) {
            for (tier, table) in self.tables() {
                for (hash_part, prefix, after) in &targets {
                    for shard in &shards {
                        let partition = tessera_core::partition_key(org, hash_part.as_deref());
                        let prefix = prefix.clone();
                        let after = after.clone();
                        let shard = *shard;
                        scans.push(async move {
                            let items =
                                self.scan_partition(table, partition, prefix, after, shard).await?;
                            self.decode_items(tier, &items)
                        });
                    }
                }
            }
        }
        let scan_count = scans.len();
        let raws: Vec<RawRecord> = try_join_all(scans).await?.into_iter().flatten().collect();

        let mut records = flatten_all(raws, self.global_organisation());
        if let Some(after) = &shape.after {
            records.retain(|r| r.id.as_str() > after.as_str());
        }
        if let Some(limit) = shape.limit {
            records.truncate(limit);
        }
        debug!(scans = scan_count, results = records.len(), "Merged query");
        Ok(records)
    }

    async fn query_global(&self, type_name: &str, value: &str) -> TesseraResult<Vec<Record>> {
        let global = self.global_organisation().to_string();
        self.index_lookup(IndexKind::Global, &global, type_name, value)
            .await
    }

    async fn query_secondary(
        &self,
        organisation_id: &str,
        type_name: &str,
        value: &str,
    ) -> TesseraResult<Vec<Record>> {
        validate_organisation(organisation_id)?;
        self.index_lookup(IndexKind::Organisation, organisation_id, type_name, value)
            .await
    }

    #[instrument(skip_all, fields(organisation_id = %organisation_id, entity_type = %record.type_name, check = check))]
    async fn put(
        &self,
        organisation_id: &str,
        record: WriteRecord,
        check: bool,
    ) -> TesseraResult<Record> {
        validate_organisation(organisation_id)?;
        let descriptor = self.descriptor(&record.type_name)?;
        let id = match &record.id {
            Some(id) if id.is_empty() => {
                return Err(ValidationError::RequiredFieldMissing {
                    field: format!("{}.id", record.type_name),
                }
                .into())
            }
            Some(id) => id.clone(),
            None => self.ids.generate(),
        };
        let key = self.item_key(organisation_id, &record.type_name, &id)?;
        let now = Utc::now();
        let created_at = record.created_at.unwrap_or(now);
        let held = record.revision;

        let mut actions = codec::payload_actions(&record, descriptor.is_hashed(), created_at, now);
        let condition = if check && held == 0 && record.provenance.is_none() {
            // A new record: a tombstone left at this location reads as
            // absent, and the counter keeps climbing past it.
            actions.push(UpdateAction::increment(attr::REVISION));
            Condition::none().with(Clause::NoPayload)
        } else if check {
            actions.push(UpdateAction::set(attr::REVISION, held + 1));
            self.guard(organisation_id, record.provenance.as_ref(), held)
        } else {
            actions.push(UpdateAction::increment(attr::REVISION));
            Condition::none()
        };

        let image = self
            .store
            .update(self.active_table(), &key, &actions, condition)
            .await
            .map_err(|e| revision_conflict(&record.type_name, &id, held, e))?;
        let stored = codec::decode(&self.registry, self.active_tier(), &image)?;

        let written = Record {
            type_name: record.type_name,
            id,
            item: record.item,
            links: record.links.merge_overlay(&stored.links),
            revision: stored.revision,
            created_at,
            updated_at: now,
            provenance: Provenance {
                tier: self.active_tier(),
                organisation_id: organisation_id.to_string(),
            },
            indexes: record.indexes,
        };
        debug!(id = %written.id, revision = written.revision, "Put accepted");

        self.publish(ChangeRecord {
            organisation_id: organisation_id.to_string(),
            id: sort_key(&written.type_name, &written.id),
            revision: written.revision,
            updated_at: now,
            payload: Some(written.item.clone()),
        })
        .await;
        Ok(written)
    }

    #[instrument(skip_all, fields(organisation_id = %organisation_id, entity_type = %record.type_name, id = %record.id, cascade = cascade))]
    async fn delete(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        cascade: bool,
    ) -> TesseraResult<bool> {
        validate_organisation(organisation_id)?;
        self.descriptor(&record.type_name)?;

        let Some(provenance) = record.provenance.clone() else {
            debug!("Delete of a record never read from storage; nothing to do");
            return Ok(false);
        };
        if provenance.organisation_id != organisation_id {
            debug!(owner = %provenance.organisation_id, "Delete of a record owned elsewhere; nothing to do");
            return Ok(false);
        }

        let mut current = record.clone();
        if current.links.has_outgoing() {
            if !cascade {
                return Err(TesseraError::DanglingLinks {
                    type_name: current.type_name.clone(),
                    id: current.id.clone(),
                    link_types: current.links.linked_types(),
                });
            }
            for target_type in current.links.linked_types() {
                let outcome = self
                    .link(organisation_id, &current, &target_type, &BTreeSet::new())
                    .await?;
                current.revision = outcome.revision;
                current.links = outcome.links;
            }
        }

        let held = current.revision;
        let key = self.item_key(organisation_id, &current.type_name, &current.id)?;
        let now = Utc::now();
        let own_tier = provenance.tier == self.active_tier();

        if own_tier
            && !self
                .visible_elsewhere(organisation_id, &current.type_name, &current.id)
                .await?
        {
            self.store
                .delete(
                    self.active_table(),
                    &key,
                    Condition::none().with(Clause::RevisionEquals(held)),
                )
                .await
                .map_err(|e| revision_conflict(&current.type_name, &current.id, held, e))?;
            debug!(revision = held, "Hard delete");
        } else {
            let mut actions = codec::tombstone_actions(now);
            actions.push(UpdateAction::set(attr::REVISION, held + 1));
            self.store
                .update(
                    self.active_table(),
                    &key,
                    &actions,
                    self.guard(organisation_id, Some(&provenance), held),
                )
                .await
                .map_err(|e| revision_conflict(&current.type_name, &current.id, held, e))?;
            debug!(revision = held + 1, "Tombstoned at active tier");
        }

        self.publish(ChangeRecord {
            organisation_id: organisation_id.to_string(),
            id: sort_key(&current.type_name, &current.id),
            revision: held + 1,
            updated_at: now,
            payload: None,
        })
        .await;
        Ok(true)
    }

    async fn link(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        ids: &BTreeSet<String>,
    ) -> TesseraResult<LinkOutcome> {
        self.reconcile_links(organisation_id, record, target_type, ids)
            .await
    }

    async fn take_backup(&self, organisation_id: &str) -> TesseraResult<Vec<BackupItem>> {
        self.export_organisation(organisation_id).await
    }

    async fn restore_backup(
        &self,
        organisation_id: &str,
        items: Vec<BackupItem>,
    ) -> TesseraResult<usize> {
        self.import_organisation(organisation_id, items).await
    }

    async fn destroy_organisation(&self, organisation_id: &str) -> TesseraResult<usize> {
        self.purge_organisation(organisation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Mutex;
    use tessera_core::{Entity, EntityMeta, QueryShape};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        #[serde(skip)]
        meta: EntityMeta,
        sku: String,
        region: String,
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

    fn widget(id: &str, sku: &str) -> Widget {
        Widget {
            meta: EntityMeta::with_id(id),
            sku: sku.to_string(),
            region: "eu".to_string(),
        }
    }

    fn registry() -> Arc<TypeRegistry> {
        let mut registry = TypeRegistry::new();
        registry
            .register::<Widget>()
            .secondary(|w: &Widget| Some(w.sku.clone()))
            .global(|w: &Widget| Some(w.sku.clone()))
            .parallel("region", |w: &Widget| Some(w.region.clone()));
        Arc::new(registry)
    }

    fn two_tier() -> (Arc<MemoryKvStore>, TieredDriver<MemoryKvStore>, TieredDriver<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let prod = TieredDriver::new(store.clone(), EngineConfig::single("prod"), registry()).unwrap();
        let stage = TieredDriver::new(
            store.clone(),
            EngineConfig::single("prod").with_tier("stage", "stage"),
            registry(),
        )
        .unwrap();
        (store, prod, stage)
    }

    fn write(driver: &TieredDriver<MemoryKvStore>, w: &Widget) -> WriteRecord {
        driver.registry.write_record(w).unwrap()
    }

    #[tokio::test]
    async fn test_put_assigns_revision_and_provenance() {
        let (_, prod, _) = two_tier();
        let record = prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        assert_eq!(record.revision, 1);
        assert_eq!(record.provenance.tier, 0);
        assert_eq!(record.provenance.organisation_id, "acme");
    }

    #[tokio::test]
    async fn test_put_generates_missing_id() {
        let (_, prod, _) = two_tier();
        let mut w = widget("x", "a");
        w.meta = EntityMeta::new();
        let record = prod.put("acme", write(&prod, &w), true).await.unwrap();
        assert!(!record.id.is_empty());
    }

    #[tokio::test]
    async fn test_stale_put_is_concurrency_error() {
        let (store, prod, _) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        let err = prod
            .put("acme", write(&prod, &widget("w1", "b")), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Concurrency { expected: 0, actual: 1, .. }
        ));
        let raw = store.raw("prod", &ItemKey::new("acme", "widget:w1")).unwrap();
        assert_eq!(raw["item"]["sku"], json!("a"));
    }

    #[tokio::test]
    async fn test_unchecked_put_advances_from_stored() {
        let (_, prod, _) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        let record = prod.put("acme", write(&prod, &widget("w1", "b")), false).await.unwrap();
        assert_eq!(record.revision, 2);
    }

    #[tokio::test]
    async fn test_stage_climbs_to_prod_and_global() {
        let (_, prod, stage) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        prod.put("global", write(&prod, &widget("g1", "shared")), true).await.unwrap();

        let found = stage
            .get(&[
                PointKey::new("acme", "widget", "w1"),
                PointKey::new("acme", "widget", "g1"),
                PointKey::new("acme", "widget", "missing"),
            ])
            .await
            .unwrap();
        assert_eq!(found[0].as_ref().map(|r| r.provenance.tier), Some(0));
        assert_eq!(
            found[1].as_ref().map(|r| r.provenance.organisation_id.as_str()),
            Some("global")
        );
        assert!(found[2].is_none());
    }

    #[tokio::test]
    async fn test_checked_put_migrates_inherited_record() {
        let (_, prod, stage) = two_tier();
        let first = prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        let held: Widget = first.clone().into_entity().unwrap();

        let migrated = stage.put("acme", write(&stage, &held), true).await.unwrap();
        assert_eq!(migrated.revision, 2);
        assert_eq!(migrated.provenance.tier, 1);

        // The same stale inherited snapshot cannot migrate twice.
        let err = stage.put("acme", write(&stage, &held), true).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_from_descendant_tombstones() {
        let (_, prod, stage) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        let seen = stage.get(&[PointKey::new("acme", "widget", "w1")]).await.unwrap();
        let seen = seen.into_iter().flatten().next().unwrap();

        assert!(stage.delete("acme", &seen.to_ref(), false).await.unwrap());
        let after = stage.get(&[PointKey::new("acme", "widget", "w1")]).await.unwrap();
        assert!(after[0].is_none());
        let ancestor = prod.get(&[PointKey::new("acme", "widget", "w1")]).await.unwrap();
        assert_eq!(ancestor[0].as_ref().map(|r| r.revision), Some(1));
    }

    #[tokio::test]
    async fn test_new_record_replaces_tombstone() {
        let (store, prod, stage) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "a")), true).await.unwrap();
        let seen = stage.get(&[PointKey::new("acme", "widget", "w1")]).await.unwrap();
        let seen = seen.into_iter().flatten().next().unwrap();
        stage.delete("acme", &seen.to_ref(), false).await.unwrap();

        let recreated = stage.put("acme", write(&stage, &widget("w1", "b")), true).await.unwrap();
        assert_eq!(recreated.revision, 3);
        let raw = store.raw("stage", &ItemKey::new("acme", "widget:w1")).unwrap();
        assert!(raw.get("deleted").is_none());

        let found = stage.get(&[PointKey::new("acme", "widget", "w1")]).await.unwrap();
        let found = found[0].as_ref().unwrap();
        assert_eq!(found.revision, 3);
        assert_eq!(found.item["sku"], json!("b"));

        // Once live again, a second fresh write conflicts as usual.
        let err = stage
            .put("acme", write(&stage, &widget("w1", "c")), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Concurrency { expected: 0, actual: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_of_foreign_record_is_noop() {
        let (_, prod, _) = two_tier();
        let shared = prod.put("global", write(&prod, &widget("g1", "s")), true).await.unwrap();
        assert!(!prod.delete("acme", &shared.to_ref(), false).await.unwrap());
        let still = prod.get(&[PointKey::new("acme", "widget", "g1")]).await.unwrap();
        assert!(still[0].is_some());
    }

    #[tokio::test]
    async fn test_query_merges_tiers_and_paginates() {
        let (_, prod, stage) = two_tier();
        for (id, sku) in [("a1", "x"), ("a2", "y"), ("b1", "z")] {
            prod.put("acme", write(&prod, &widget(id, sku)), true).await.unwrap();
        }
        stage.put("acme", write(&stage, &widget("a3", "w")), true).await.unwrap();

        let all = stage
            .query(&QueryKey::new("acme", "widget", QueryShape::all().starts_with("a")))
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);

        let page = stage
            .query(&QueryKey::new(
                "acme",
                "widget",
                QueryShape::all().starts_with("a").after("a1").limit(1),
            ))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "a2");
    }

    #[tokio::test]
    async fn test_query_paginates_below_page_size() {
        let store = Arc::new(MemoryKvStore::new());
        let driver = TieredDriver::new(
            store,
            EngineConfig::single("prod").with_scan_page_size(2),
            registry(),
        )
        .unwrap();
        for i in 0..5 {
            driver
                .put("acme", write(&driver, &widget(&format!("w{i}"), "s")), true)
                .await
                .unwrap();
        }
        let all = driver
            .query(&QueryKey::new("acme", "widget", QueryShape::all()))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_parallel_query_requires_declared_key() {
        let (_, prod, _) = two_tier();
        for i in 0..6 {
            prod.put("acme", write(&prod, &widget(&format!("w{i}"), "s")), true)
                .await
                .unwrap();
        }
        let all = prod
            .query(&QueryKey::new("acme", "widget", QueryShape::all().parallel(3, "region")))
            .await
            .unwrap();
        assert_eq!(all.len(), 6);

        let err = prod
            .query(&QueryKey::new("acme", "widget", QueryShape::all().parallel(3, "colour")))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Validation(_)));
    }

    #[tokio::test]
    async fn test_index_lookups() {
        let (_, prod, stage) = two_tier();
        prod.put("acme", write(&prod, &widget("w1", "blue")), true).await.unwrap();
        prod.put("other", write(&prod, &widget("w2", "blue")), true).await.unwrap();

        let global = prod.query_global("widget", "blue").await.unwrap();
        assert_eq!(global.len(), 2);
        let scoped = prod.query_secondary("acme", "widget", "blue").await.unwrap();
        assert_eq!(scoped.len(), 1);

        // A stage override of the indexed field hides the prod hit.
        let inherited: Widget = stage
            .get(&[PointKey::new("acme", "widget", "w1")])
            .await
            .unwrap()
            .remove(0)
            .unwrap()
            .into_entity()
            .unwrap();
        let mut changed = inherited.clone();
        changed.sku = "red".to_string();
        stage.put("acme", write(&stage, &changed), true).await.unwrap();
        assert!(stage.query_secondary("acme", "widget", "blue").await.unwrap().is_empty());
        assert_eq!(stage.query_secondary("acme", "widget", "red").await.unwrap().len(), 1);
    }

    struct Recorder(Mutex<Vec<ChangeRecord>>);

    #[async_trait]
    impl ChangeSink for Recorder {
        async fn publish(&self, change: ChangeRecord) -> TesseraResult<()> {
            self.0.lock().unwrap().push(change);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_change_sink_sees_accepted_writes() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let store = Arc::new(MemoryKvStore::new());
        let driver = TieredDriver::new(store, EngineConfig::single("prod"), registry())
            .unwrap()
            .with_change_sink(recorder.clone());

        let record = driver.put("acme", write(&driver, &widget("w1", "a")), true).await.unwrap();
        let _ = driver.put("acme", write(&driver, &widget("w1", "b")), true).await;
        driver.delete("acme", &record.to_ref(), false).await.unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].id, "widget:w1");
        assert_eq!(seen[0].revision, 1);
        assert!(seen[1].payload.is_none());
    }
}
