//! In-memory store for tests and single-process use.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tessera_core::StorageError;

use super::{
    apply_updates, Condition, IndexKind, Item, ItemKey, KvResult, KvStore, ScanPage, ScanRequest,
    UpdateAction,
};

type Table = BTreeMap<ItemKey, Item>;

/// One sorted map per table behind a single lock, so a conditional write's
/// check and mutation are atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Raw item, bypassing the engine. Used by tests to inspect a single tier.
    pub fn raw(&self, table: &str, key: &ItemKey) -> Option<Item> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    fn read<R>(&self, table: &str, f: impl FnOnce(&Table) -> R) -> KvResult<R> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let empty = Table::new();
        Ok(f(tables.get(table).unwrap_or(&empty)))
    }

    fn write<R>(&self, table: &str, f: impl FnOnce(&mut Table) -> KvResult<R>) -> KvResult<R> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        f(tables.entry(table.to_string()).or_default())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> KvResult<Vec<Item>> {
        self.read(table, |t| keys.iter().filter_map(|k| t.get(k).cloned()).collect())
    }

    async fn query(&self, table: &str, request: ScanRequest) -> KvResult<ScanPage> {
        self.read(table, |t| {
            let from = match &request.after {
                Some(after) if after.as_str() > request.prefix.as_str() => after.clone(),
                _ => request.prefix.clone(),
            };
            let start = ItemKey::new(request.partition.clone(), from);
            let mut page = ScanPage::default();
            let mut consumed: Option<&str> = None;
            let mut evaluated = 0usize;
            let matching = t
                .range(start..)
                .take_while(|(k, _)| {
                    k.partition == request.partition && k.sort_key.starts_with(&request.prefix)
                })
                .filter(|(k, _)| request.after.as_deref() != Some(k.sort_key.as_str()));

            for (key, item) in matching {
                if evaluated == request.limit {
                    // More remain; the cursor is the last key consumed.
                    page.last_evaluated = consumed.map(str::to_string);
                    break;
                }
                evaluated += 1;
                consumed = Some(key.sort_key.as_str());
                if request.shard.map_or(true, |s| s.matches(item)) {
                    page.items.push(item.clone());
                }
            }
            page
        })
    }

    async fn query_index(
        &self,
        table: &str,
        kind: IndexKind,
        value: &str,
        organisation_id: Option<&str>,
    ) -> KvResult<Vec<Item>> {
        let attribute = kind.attribute();
        self.read(table, |t| {
            t.iter()
                .filter(|(k, _)| organisation_id.map_or(true, |org| k.owned_by(org)))
                .filter(|(_, item)| item.get(attribute).and_then(Value::as_str) == Some(value))
                .map(|(_, item)| item.clone())
                .collect()
        })
    }

    async fn put(&self, table: &str, item: Item, condition: Condition) -> KvResult<()> {
        let key = ItemKey::of(&item)?;
        self.write(table, |t| {
            condition.check(table, t.get(&key))?;
            t.insert(key, item);
            Ok(())
        })
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[UpdateAction],
        condition: Condition,
    ) -> KvResult<Item> {
        self.write(table, |t| {
            let current = t.get(key);
            condition.check(table, current)?;
            let next = apply_updates(key, current.cloned(), actions)?;
            t.insert(key.clone(), next.clone());
            Ok(next)
        })
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: Condition) -> KvResult<bool> {
        self.write(table, |t| {
            condition.check(table, t.get(key))?;
            Ok(t.remove(key).is_some())
        })
    }

    async fn scan_owned(&self, table: &str, organisation_id: &str) -> KvResult<Vec<Item>> {
        self.read(table, |t| {
            t.iter()
                .filter(|(k, _)| k.owned_by(organisation_id))
                .map(|(_, item)| item.clone())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Clause, ShardFilter};
    use serde_json::json;

    fn item(partition: &str, sort_key: &str, extra: Value) -> Item {
        let mut item = Item::new();
        item.insert("organisationId".into(), json!(partition));
        item.insert("id".into(), json!(sort_key));
        if let Value::Object(extra) = extra {
            item.extend(extra);
        }
        item
    }

    async fn seeded() -> MemoryKvStore {
        let store = MemoryKvStore::new();
        for (p, s) in [
            ("acme", "gadget:1"),
            ("acme", "widget:1"),
            ("acme", "widget:2"),
            ("acme", "widget:3"),
            ("acme#ab", "widget:9"),
            ("other", "widget:1"),
        ] {
            store
                .put("tbl", item(p, s, json!({"revision": 1})), Condition::none())
                .await
                .unwrap();
        }
        store
    }

    fn sort_keys(items: &[Item]) -> Vec<String> {
        items
            .iter()
            .map(|i| i["id"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_query_prefix_stays_in_partition() {
        let store = seeded().await;
        let page = store
            .query(
                "tbl",
                ScanRequest {
                    partition: "acme".into(),
                    prefix: "widget:".into(),
                    after: None,
                    limit: 10,
                    shard: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(sort_keys(&page.items), vec!["widget:1", "widget:2", "widget:3"]);
        assert!(page.last_evaluated.is_none());
    }

    #[tokio::test]
    async fn test_query_paginates_with_exclusive_cursor() {
        let store = seeded().await;
        let request = |after: Option<String>| ScanRequest {
            partition: "acme".into(),
            prefix: "widget:".into(),
            after,
            limit: 2,
            shard: None,
        };
        let first = store.query("tbl", request(None)).await.unwrap();
        assert_eq!(sort_keys(&first.items), vec!["widget:1", "widget:2"]);
        let second = store
            .query("tbl", request(first.last_evaluated.clone()))
            .await
            .unwrap();
        assert_eq!(sort_keys(&second.items), vec!["widget:3"]);
        assert!(second.last_evaluated.is_none());
    }

    #[tokio::test]
    async fn test_query_shard_filter() {
        let store = MemoryKvStore::new();
        for (i, hash) in [0u64, 1, 2, 3].iter().enumerate() {
            store
                .put(
                    "tbl",
                    item("acme", &format!("widget:{i}"), json!({"parallelHash": hash})),
                    Condition::none(),
                )
                .await
                .unwrap();
        }
        let page = store
            .query(
                "tbl",
                ScanRequest {
                    partition: "acme".into(),
                    prefix: "widget:".into(),
                    after: None,
                    limit: 10,
                    shard: Some(ShardFilter { shard: 1, count: 2 }),
                },
            )
            .await
            .unwrap();
        assert_eq!(sort_keys(&page.items), vec!["widget:1", "widget:3"]);
    }

    #[tokio::test]
    async fn test_conditional_put_rejects_stale_revision() {
        let store = seeded().await;
        let err = store
            .put(
                "tbl",
                item("acme", "widget:1", json!({"revision": 2})),
                Condition::none().with(Clause::RevisionEquals(0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConditionFailed { .. }));
        let raw = store.raw("tbl", &ItemKey::new("acme", "widget:1")).unwrap();
        assert_eq!(raw["revision"], json!(1));
    }

    #[tokio::test]
    async fn test_update_creates_missing_item() {
        let store = MemoryKvStore::new();
        let key = ItemKey::new("acme", "widget:new");
        let image = store
            .update(
                "tbl",
                &key,
                &[UpdateAction::increment("revision")],
                Condition::none().with(Clause::RevisionEquals(0)),
            )
            .await
            .unwrap();
        assert_eq!(image["revision"], json!(1));
        assert_eq!(store.len("tbl"), 1);
    }

    #[tokio::test]
    async fn test_scan_owned_and_index() {
        let store = seeded().await;
        let owned = store.scan_owned("tbl", "acme").await.unwrap();
        assert_eq!(owned.len(), 5);

        store
            .put(
                "tbl",
                item("other", "widget:7", json!({"secondaryGlobal": "widget:x"})),
                Condition::none(),
            )
            .await
            .unwrap();
        let global = store
            .query_index("tbl", IndexKind::Global, "widget:x", None)
            .await
            .unwrap();
        assert_eq!(global.len(), 1);
        let scoped = store
            .query_index("tbl", IndexKind::Global, "widget:x", Some("acme"))
            .await
            .unwrap();
        assert!(scoped.is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let store = seeded().await;
        let key = ItemKey::new("acme", "widget:2");
        assert!(store.delete("tbl", &key, Condition::none()).await.unwrap());
        assert!(!store.delete("tbl", &key, Condition::none()).await.unwrap());
    }
}
