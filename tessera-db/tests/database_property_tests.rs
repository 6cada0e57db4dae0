//! Property-Based Tests for the Database Façade
//!
//! Covers read batching and read-your-writes inside one unit of work, the
//! unique index lookups, authorization gating, the write buffer, and the
//! backup/restore/purge surfaces.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tessera_db::{
    AuthorizationRequest, Database, Engine, Entity, LmdbKvStore, QueryShape, TesseraError,
    WriteAction,
};
use tessera_test_utils::{
    arb_id, fixture_registry, gadget, part, prod_config, widget, CountingKvStore, Gadget,
    MemoryKvStore, Part, RecordingSink, Widget,
};
use tokio::runtime::Runtime;

#[path = "support/engine.rs"]
mod test_engine_support;
use test_engine_support::test_engine;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn counting_engine(store: &Arc<CountingKvStore>) -> Engine {
    Engine::builder(store.clone())
        .config(prod_config())
        .registry(fixture_registry())
        .build()
        .unwrap()
}

// ============================================================================
// BATCHING AND READ-YOUR-WRITES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any number of concurrent loads in one unit of work, duplicates
    /// included, reach the store as a single batched read.
    #[test]
    fn prop_concurrent_loads_share_one_batch(ids in prop::collection::vec(arb_id(), 1..20)) {
        let rt = test_runtime()?;
        let store = Arc::new(CountingKvStore::new());
        let engine = counting_engine(&store);

        let result: Result<(), TestCaseError> = rt.block_on(async {
            let db = engine.database("acme").map_err(|e| TestCaseError::fail(e.to_string()))?;
            let distinct: BTreeSet<&String> = ids.iter().collect();
            for id in &distinct {
                db.put(&widget(id, "AB-01")).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let before = store.batch_gets();

            let loaded: Vec<Option<Widget>> = db
                .scope(db.get_many(&ids))
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(store.batch_gets() - before, 1);
            prop_assert_eq!(loaded.len(), ids.len());
            for (id, widget) in ids.iter().zip(&loaded) {
                prop_assert_eq!(widget.as_ref().and_then(|w| w.id()), Some(id.as_str()));
            }

            // Served from the cache.
            let again: Vec<Option<Widget>> = db
                .scope(db.get_many(&ids))
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(store.batch_gets() - before, 1);
            prop_assert_eq!(again.len(), loaded.len());
            Ok(())
        });
        result?;
    }
}

#[tokio::test]
async fn test_writes_invalidate_cached_reads() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let db = engine.database("acme").unwrap();
    db.put(&widget("w1", "AB-01")).await.unwrap();

    db.scope(async {
        let first: Widget = db.get("w1").await?.unwrap();
        let listed: Vec<Widget> = db.query(QueryShape::all()).await?;
        assert_eq!(listed.len(), 1);

        let mut renamed = first.clone();
        renamed.name = "renamed".to_string();
        db.put(&renamed).await?;
        db.put(&widget("w2", "AB-02")).await?;

        let reread: Widget = db.get("w1").await?.unwrap();
        assert_eq!(reread.name, "renamed");
        assert_eq!(reread.revision(), 2);
        let relisted: Vec<Widget> = db.query(QueryShape::all()).await?;
        assert_eq!(relisted.len(), 2);
        Ok::<_, TesseraError>(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_start_drives_loads_until_done() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let db = engine.database("acme").unwrap();
    db.put(&widget("w1", "AB-01")).await.unwrap();

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let work = async {
        let loaded: Option<Widget> = db.get("w1").await.unwrap();
        let _ = stop.send(());
        loaded
    };
    let (loaded, ()) = tokio::join!(work, db.start(async {
        let _ = stopped.await;
    }));
    assert!(loaded.is_some());
}

// ============================================================================
// INDEX LOOKUPS
// ============================================================================

#[tokio::test]
async fn test_secondary_unique_lookup() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let acme = engine.database("acme").unwrap();
    let globex = engine.database("globex").unwrap();

    acme.put(&widget("w1", "AB-01")).await.unwrap();
    globex.put(&widget("w9", "AB-01")).await.unwrap();

    let found: Option<Widget> = acme.query_secondary_unique("AB-01").await.unwrap();
    assert_eq!(found.unwrap().id(), Some("w1"));
    let missing: Option<Widget> = acme.query_secondary_unique("ZZ-99").await.unwrap();
    assert!(missing.is_none());

    acme.put(&widget("w2", "AB-01")).await.unwrap();
    let err = acme
        .query_secondary_unique::<Widget>("AB-01")
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::Multiplicity { count: 2, .. }));
}

#[tokio::test]
async fn test_global_lookup_spans_tenants() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let acme = engine.database("acme").unwrap();
    let globex = engine.database("globex").unwrap();

    acme.put(&widget("w1", "AB-01")).await.unwrap();
    let found: Option<Widget> = globex.query_global_unique("AB-01").await.unwrap();
    assert_eq!(found.unwrap().id(), Some("w1"));

    globex.put(&widget("w2", "AB-01")).await.unwrap();
    let all: Vec<Widget> = acme.query_global("AB-01").await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(matches!(
        acme.query_global_unique::<Widget>("AB-01").await,
        Err(TesseraError::Multiplicity { .. })
    ));
}

#[tokio::test]
async fn test_index_lookup_on_undeclared_type_is_rejected() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let db = engine.database("acme").unwrap();
    assert!(db.query_secondary::<Gadget>("anything").await.is_err());
}

// ============================================================================
// AUTHORIZATION
// ============================================================================

#[tokio::test]
async fn test_denied_writes_issue_no_io() {
    let store = Arc::new(CountingKvStore::new());
    let engine = Engine::builder(store.clone())
        .config(prod_config())
        .registry(fixture_registry())
        .authorizer(|r: &AuthorizationRequest| {
            r.action == WriteAction::Put && r.id.as_deref() != Some("locked")
        })
        .build()
        .unwrap();
    let db = engine.database("acme").unwrap();

    let owner = db.put(&widget("w1", "AB-01")).await.unwrap();
    db.put(&gadget("g1")).await.unwrap();
    let calls = store.calls();

    let denied = [
        db.put(&widget("locked", "AB-02")).await.map(|_| ()),
        db.link(&owner, Gadget::TYPE, ["g1"]).await.map(|_| ()),
        db.delete(&owner, false).await.map(|_| ()),
    ];
    for result in denied {
        assert!(matches!(result, Err(TesseraError::Forbidden { .. })));
    }
    assert_eq!(store.calls(), calls);
}

#[tokio::test]
async fn test_denied_write_keeps_cached_value() {
    let store = Arc::new(CountingKvStore::new());
    let engine = Engine::builder(store.clone())
        .config(prod_config())
        .registry(fixture_registry())
        .authorizer(|r: &AuthorizationRequest| r.action != WriteAction::Delete)
        .build()
        .unwrap();
    let db = engine.database("acme").unwrap();
    db.put(&widget("w1", "AB-01")).await.unwrap();

    let cached: Widget = db.scope(db.get("w1")).await.unwrap().unwrap();
    let (reads, writes) = (store.reads(), store.writes());
    assert!(db.delete(&cached, false).await.is_err());
    let again: Option<Widget> = db.scope(db.get("w1")).await.unwrap();
    assert!(again.is_some());
    assert_eq!(store.reads(), reads);
    assert_eq!(store.writes(), writes);
}

// ============================================================================
// WRITE BUFFER
// ============================================================================

#[tokio::test]
async fn test_write_buffer_round_trip() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    let buffer = engine.write_buffer();

    let pending: Vec<_> = (0..5)
        .map(|i| buffer.put("acme", &widget(&format!("w{i}"), "AB-01"), true).unwrap())
        .collect();
    let other = buffer.put("globex", &gadget("g1"), true).unwrap();
    assert_eq!(buffer.len(), 6);
    assert_eq!(buffer.flush().await, 6);

    for write in pending {
        assert_eq!(write.wait().await.unwrap().revision(), 1);
    }
    assert_eq!(other.wait().await.unwrap().revision(), 1);

    let db = engine.database("acme").unwrap();
    let listed: Vec<Widget> = db.scope(db.query(QueryShape::all())).await.unwrap();
    assert_eq!(listed.len(), 5);
}

// ============================================================================
// BACKUP, RESTORE AND PURGE
// ============================================================================

async fn seed(db: &Database) {
    let w = db.put(&widget("w1", "AB-01")).await.unwrap();
    db.put(&gadget("g1")).await.unwrap();
    db.put(&part("ab12")).await.unwrap();
    db.link(&w, Gadget::TYPE, ["g1"]).await.unwrap();
}

#[tokio::test]
async fn test_backup_restores_into_fresh_tenant() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    seed(&engine.database("acme").unwrap()).await;

    let backup = engine.take_backup("acme").await.unwrap();
    assert_eq!(backup.len(), 3);
    assert!(backup.iter().any(|item| item.hashed));

    let restored = engine.restore_backup("copy", backup).await.unwrap();
    assert_eq!(restored, 3);

    let copy = engine.database("copy").unwrap();
    let (w, p) = copy
        .scope(async {
            let w: Option<Widget> = copy.get("w1").await?;
            let p: Option<Part> = copy.get("ab12").await?;
            Ok::<_, TesseraError>((w, p))
        })
        .await
        .unwrap();
    let w = w.unwrap();
    assert!(w.links().contains(Gadget::TYPE, "g1"));
    assert_eq!(w.meta.provenance().unwrap().organisation_id, "copy");
    assert_eq!(p.unwrap().serial, "SN-ab12");
}

#[tokio::test]
async fn test_destroy_organisation_removes_only_its_records() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = test_engine(&store, prod_config());
    seed(&engine.database("acme").unwrap()).await;
    seed(&engine.database("acmex").unwrap()).await;

    assert_eq!(engine.destroy_organisation("acme").await.unwrap(), 3);
    assert!(engine.take_backup("acme").await.unwrap().is_empty());
    assert_eq!(engine.take_backup("acmex").await.unwrap().len(), 3);
}

// ============================================================================
// CHANGE STREAM
// ============================================================================

#[tokio::test]
async fn test_change_sink_sees_every_accepted_write() {
    let sink = RecordingSink::new();
    let engine = Engine::builder(Arc::new(MemoryKvStore::new()))
        .config(prod_config())
        .registry(fixture_registry())
        .change_sink(sink.clone())
        .build()
        .unwrap();
    let db = engine.database("acme").unwrap();

    let w = db.put(&widget("w1", "AB-01")).await.unwrap();
    db.put(&gadget("g1")).await.unwrap();
    let w = db.link(&w, Gadget::TYPE, ["g1"]).await.unwrap();
    db.delete(&w, true).await.unwrap();

    let changes = sink.changes();
    let own: Vec<u64> = changes
        .iter()
        .filter(|c| c.id == "widget:w1")
        .map(|c| c.revision)
        .collect();
    assert_eq!(own.first(), Some(&1));
    assert!(own.windows(2).all(|pair| pair[0] < pair[1]));
    let last = changes.iter().rev().find(|c| c.id == "widget:w1").unwrap();
    assert!(last.payload.is_none());
    assert!(changes.iter().all(|c| c.organisation_id == "acme"));
}

// ============================================================================
// PERSISTENT BACKEND
// ============================================================================

#[tokio::test]
async fn test_lmdb_backend_serves_the_full_surface() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LmdbKvStore::open(dir.path(), 16).unwrap());
    let engine = Engine::builder(store)
        .config(prod_config())
        .registry(fixture_registry())
        .build()
        .unwrap();
    let db = engine.database("acme").unwrap();

    let w = db.put(&widget("w1", "AB-01")).await.unwrap();
    db.put(&gadget("g1")).await.unwrap();
    db.put(&part("p1")).await.unwrap();
    let w = db.link(&w, Gadget::TYPE, ["g1"]).await.unwrap();
    assert_eq!(w.revision(), 2);

    let (by_sku, linked, parts) = db
        .scope(async {
            let by_sku: Option<Widget> = db.query_secondary_unique("AB-01").await?;
            let linked: Vec<Gadget> = db.get_links(&w).await?;
            let parts: Vec<Part> = db.query(QueryShape::all()).await?;
            Ok::<_, TesseraError>((by_sku, linked, parts))
        })
        .await
        .unwrap();
    assert_eq!(by_sku.unwrap().id(), Some("w1"));
    assert_eq!(linked.len(), 1);
    assert_eq!(parts.len(), 1);

    assert_eq!(engine.take_backup("acme").await.unwrap().len(), 3);
    assert!(db.delete(&w, true).await.unwrap());
    let gone: Option<Widget> = db.scope(db.get("w1")).await.unwrap();
    assert!(gone.is_none());
}
