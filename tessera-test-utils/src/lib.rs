//! Tessera Test Utilities
//!
//! Shared test infrastructure for the Tessera workspace:
//! - Fixture entity types and a registry that exercises every index kind
//! - Tier configurations for climbing scenarios
//! - A call-counting key-value store and a recording change sink
//! - Proptest generators and custom assertions

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

pub use tessera_core::{
    ChangeRecord, ChangeSink, EngineConfig, Entity, EntityMeta, PrefixHashLocator, TesseraError,
    TesseraResult, TypeRegistry,
};
pub use tessera_storage::{
    Condition, IndexKind, Item, ItemKey, KvResult, KvStore, MemoryKvStore, ScanPage, ScanRequest,
    UpdateAction,
};

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Indexed on `sku` (secondary and global) and sharded by `region`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(skip)]
    pub meta: EntityMeta,
    pub sku: String,
    pub region: String,
    pub name: String,
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

/// Plain linkable entity with no indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gadget {
    #[serde(skip)]
    pub meta: EntityMeta,
    pub label: String,
}

impl Entity for Gadget {
    const TYPE: &'static str = "gadget";
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Stored in hashed partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(skip)]
    pub meta: EntityMeta,
    pub serial: String,
}

impl Entity for Part {
    const TYPE: &'static str = "part";
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

pub fn widget(id: &str, sku: &str) -> Widget {
    Widget {
        meta: EntityMeta::with_id(id),
        sku: sku.to_string(),
        region: "eu".to_string(),
        name: format!("Widget {id}"),
    }
}

pub fn gadget(id: &str) -> Gadget {
    Gadget {
        meta: EntityMeta::with_id(id),
        label: id.to_uppercase(),
    }
}

pub fn part(id: &str) -> Part {
    Part {
        meta: EntityMeta::with_id(id),
        serial: format!("SN-{id}"),
    }
}

/// Registry covering [`Widget`], [`Gadget`] and [`Part`].
pub fn fixture_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register::<Widget>()
        .secondary(|w: &Widget| Some(w.sku.clone()))
        .global(|w: &Widget| Some(w.sku.clone()))
        .parallel("region", |w: &Widget| Some(w.region.clone()));
    registry.register::<Gadget>();
    registry.register::<Part>().hashed(PrefixHashLocator::new(2));
    registry
}

// ============================================================================
// TIER CONFIGURATIONS
// ============================================================================

/// Single `prod` tier.
pub fn prod_config() -> EngineConfig {
    EngineConfig::single("prod")
}

/// `prod` with a `stage` tier above it; `stage` is active.
pub fn stage_config() -> EngineConfig {
    EngineConfig::single("prod").with_tier("stage", "stage")
}

// ============================================================================
// COUNTING STORE
// ============================================================================

/// [`MemoryKvStore`] wrapper counting calls per operation.
#[derive(Debug, Default)]
pub struct CountingKvStore {
    inner: MemoryKvStore,
    reads: AtomicUsize,
    writes: AtomicUsize,
    batch_gets: AtomicUsize,
}

impl CountingKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read call: batch gets, scans and index lookups.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn batch_gets(&self) -> usize {
        self.batch_gets.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.reads() + self.writes()
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for CountingKvStore {
    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> KvResult<Vec<Item>> {
        self.read();
        self.batch_gets.fetch_add(1, Ordering::SeqCst);
        self.inner.batch_get(table, keys).await
    }

    async fn query(&self, table: &str, request: ScanRequest) -> KvResult<ScanPage> {
        self.read();
        self.inner.query(table, request).await
    }

    async fn query_index(
        &self,
        table: &str,
        kind: IndexKind,
        value: &str,
        organisation_id: Option<&str>,
    ) -> KvResult<Vec<Item>> {
        self.read();
        self.inner
            .query_index(table, kind, value, organisation_id)
            .await
    }

    async fn put(&self, table: &str, item: Item, condition: Condition) -> KvResult<()> {
        self.write();
        self.inner.put(table, item, condition).await
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[UpdateAction],
        condition: Condition,
    ) -> KvResult<Item> {
        self.write();
        self.inner.update(table, key, actions, condition).await
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: Condition) -> KvResult<bool> {
        self.write();
        self.inner.delete(table, key, condition).await
    }

    async fn scan_owned(&self, table: &str, organisation_id: &str) -> KvResult<Vec<Item>> {
        self.read();
        self.inner.scan_owned(table, organisation_id).await
    }
}

// ============================================================================
// RECORDING SINK
// ============================================================================

/// Change sink that keeps every record it is handed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    changes: Mutex<Vec<ChangeRecord>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChangeSink for RecordingSink {
    async fn publish(&self, change: ChangeRecord) -> TesseraResult<()> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
        Ok(())
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Organisation ids that pass validation.
pub fn arb_organisation() -> impl Strategy<Value = String> {
    "[a-z]{3,8}"
}

pub fn arb_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,6}"
}

/// Small id sets drawn from a narrow alphabet so that sets overlap often.
pub fn arb_id_set() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-e]", 0..5)
}

/// A widget that has never been stored.
pub fn arb_widget() -> impl Strategy<Value = Widget> {
    (arb_id(), "[A-Z]{2}-[0-9]{2}", prop::sample::select(vec!["eu", "us", "ap"]), ".{0,16}")
        .prop_map(|(id, sku, region, name)| Widget {
            meta: EntityMeta::with_id(id),
            sku,
            region: region.to_string(),
            name,
        })
}

// ============================================================================
// ASSERTIONS
// ============================================================================

/// Assert `result` failed with an optimistic-concurrency conflict.
pub fn assert_concurrency<T: std::fmt::Debug>(result: &TesseraResult<T>) {
    match result {
        Err(TesseraError::Concurrency { .. }) => {}
        other => panic!("expected concurrency error, got {other:?}"),
    }
}

/// Assert the entity has been stored exactly `revision` times.
pub fn assert_revision<T: Entity>(entity: &T, revision: u64) {
    assert_eq!(
        entity.revision(),
        revision,
        "{} {:?} has unexpected revision",
        T::TYPE,
        entity.id()
    );
}
