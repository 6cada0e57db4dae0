//! LMDB-backed store.
//!
//! Uses the heed crate. Each table is a named database in one environment.
//!
//! # Key Format
//!
//! `[partition bytes][0x1F][sort key bytes]`. The unit separator never
//! appears in organisation ids or type tags, so a partition's keys form one
//! contiguous range and `acme` never prefixes `acme#01`.
//!
//! # Atomicity
//!
//! LMDB serializes write transactions, so a conditional write reads the
//! current item and writes the new one inside a single `RwTxn`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tessera_core::StorageError;

use super::{
    apply_updates, Condition, IndexKind, Item, ItemKey, KvResult, KvStore, ScanPage, ScanRequest,
    UpdateAction,
};

const SEPARATOR: u8 = 0x1F;

/// Upper bound on named databases (tables) per environment.
const MAX_TABLES: u32 = 64;

fn encode_key(key: &ItemKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(key.partition.len() + 1 + key.sort_key.len());
    bytes.extend_from_slice(key.partition.as_bytes());
    bytes.push(SEPARATOR);
    bytes.extend_from_slice(key.sort_key.as_bytes());
    bytes
}

fn decode_key(bytes: &[u8]) -> Option<ItemKey> {
    let split = bytes.iter().position(|b| *b == SEPARATOR)?;
    let partition = std::str::from_utf8(&bytes[..split]).ok()?;
    let sort_key = std::str::from_utf8(&bytes[split + 1..]).ok()?;
    Some(ItemKey::new(partition, sort_key))
}

fn partition_prefix(partition: &str, sort_prefix: &str) -> Vec<u8> {
    encode_key(&ItemKey::new(partition, sort_prefix))
}

fn backend(table: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend {
        table: table.to_string(),
        reason: err.to_string(),
    }
}

fn decode_item(table: &str, bytes: &[u8]) -> KvResult<Item> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Codec {
        key: table.to_string(),
        reason: e.to_string(),
    })
}

fn encode_item(table: &str, item: &Item) -> KvResult<Vec<u8>> {
    serde_json::to_vec(item).map_err(|e| StorageError::Codec {
        key: table.to_string(),
        reason: e.to_string(),
    })
}

/// Persistent store over a single LMDB environment.
pub struct LmdbKvStore {
    env: Env,
    tables: RwLock<HashMap<String, Database<Bytes, Bytes>>>,
}

impl LmdbKvStore {
    /// Open (creating if needed) an environment at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or LMDB refuses the
    /// environment.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> KvResult<Self> {
        std::fs::create_dir_all(&path).map_err(|e| backend("<env>", e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(MAX_TABLES)
                .open(path.as_ref())
        }
        .map_err(|e| backend("<env>", e))?;

        Ok(Self {
            env,
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Database handle for `table`, created on first use.
    fn database(&self, table: &str) -> KvResult<Database<Bytes, Bytes>> {
        if let Some(db) = self
            .tables
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(table)
        {
            return Ok(*db);
        }
        let mut wtxn = self.env.write_txn().map_err(|e| backend(table, e))?;
        let db = self
            .env
            .create_database::<Bytes, Bytes>(&mut wtxn, Some(table))
            .map_err(|e| backend(table, e))?;
        wtxn.commit().map_err(|e| backend(table, e))?;
        self.tables
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(table.to_string(), db);
        Ok(db)
    }

    /// Every item whose encoded key starts with `prefix`.
    fn collect_prefix(
        &self,
        table: &str,
        prefix: &[u8],
        mut keep: impl FnMut(&ItemKey, &Item) -> bool,
    ) -> KvResult<Vec<Item>> {
        let db = self.database(table)?;
        let rtxn = self.env.read_txn().map_err(|e| backend(table, e))?;
        let mut items = Vec::new();
        let mut visit = |raw_key: &[u8], raw_value: &[u8]| -> KvResult<()> {
            if let Some(key) = decode_key(raw_key) {
                let item = decode_item(table, raw_value)?;
                if keep(&key, &item) {
                    items.push(item);
                }
            }
            Ok(())
        };

        if prefix.is_empty() {
            for entry in db.iter(&rtxn).map_err(|e| backend(table, e))? {
                let (raw_key, raw_value) = entry.map_err(|e| backend(table, e))?;
                visit(raw_key, raw_value)?;
            }
        } else {
            for entry in db.prefix_iter(&rtxn, prefix).map_err(|e| backend(table, e))? {
                let (raw_key, raw_value) = entry.map_err(|e| backend(table, e))?;
                visit(raw_key, raw_value)?;
            }
        }
        Ok(items)
    }

    /// Read-check-write inside one write transaction.
    fn mutate<R>(
        &self,
        table: &str,
        key: &ItemKey,
        condition: &Condition,
        f: impl FnOnce(Option<Item>) -> KvResult<(Option<Item>, R)>,
    ) -> KvResult<R> {
        let encoded = encode_key(key);
        let db = self.database(table)?;
        let mut wtxn = self.env.write_txn().map_err(|e| backend(table, e))?;

        let current = match db.get(&wtxn, &encoded).map_err(|e| backend(table, e))? {
            Some(bytes) => Some(decode_item(table, bytes)?),
            None => None,
        };
        condition.check(table, current.as_ref())?;

        let (next, result) = f(current)?;
        match next {
            Some(item) => {
                let bytes = encode_item(table, &item)?;
                db.put(&mut wtxn, &encoded, &bytes)
                    .map_err(|e| backend(table, e))?;
            }
            None => {
                db.delete(&mut wtxn, &encoded)
                    .map_err(|e| backend(table, e))?;
            }
        }
        wtxn.commit().map_err(|e| backend(table, e))?;
        Ok(result)
    }
}

#[async_trait]
impl KvStore for LmdbKvStore {
    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> KvResult<Vec<Item>> {
        let db = self.database(table)?;
        let rtxn = self.env.read_txn().map_err(|e| backend(table, e))?;
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = db.get(&rtxn, &encode_key(key)).map_err(|e| backend(table, e))? {
                items.push(decode_item(table, bytes)?);
            }
        }
        Ok(items)
    }

    async fn query(&self, table: &str, request: ScanRequest) -> KvResult<ScanPage> {
        let prefix = partition_prefix(&request.partition, &request.prefix);
        let after = request.after.clone();
        let mut page = ScanPage::default();
        let mut consumed: Option<String> = None;
        let mut evaluated = 0usize;

        // Items arrive in key order; skip up to and including the cursor.
        let candidates = self.collect_prefix(table, &prefix, |key, _| {
            after.as_deref().map_or(true, |a| key.sort_key.as_str() > a)
        })?;
        for item in candidates {
            let key = ItemKey::of(&item)?;
            if evaluated == request.limit {
                page.last_evaluated = consumed;
                break;
            }
            evaluated += 1;
            consumed = Some(key.sort_key);
            if request.shard.map_or(true, |s| s.matches(&item)) {
                page.items.push(item);
            }
        }
        Ok(page)
    }

    async fn query_index(
        &self,
        table: &str,
        kind: IndexKind,
        value: &str,
        organisation_id: Option<&str>,
    ) -> KvResult<Vec<Item>> {
        let attribute = kind.attribute();
        let prefix = organisation_id.map(str::as_bytes).unwrap_or_default();
        self.collect_prefix(table, prefix, |key, item| {
            organisation_id.map_or(true, |org| key.owned_by(org))
                && item.get(attribute).and_then(|v| v.as_str()) == Some(value)
        })
    }

    async fn put(&self, table: &str, item: Item, condition: Condition) -> KvResult<()> {
        let key = ItemKey::of(&item)?;
        self.mutate(table, &key, &condition, |_| Ok((Some(item), ())))
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[UpdateAction],
        condition: Condition,
    ) -> KvResult<Item> {
        self.mutate(table, key, &condition, |current| {
            let next = apply_updates(key, current, actions)?;
            Ok((Some(next.clone()), next))
        })
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: Condition) -> KvResult<bool> {
        self.mutate(table, key, &condition, |current| {
            let existed = current.is_some();
            Ok((None, existed))
        })
    }

    async fn scan_owned(&self, table: &str, organisation_id: &str) -> KvResult<Vec<Item>> {
        self.collect_prefix(table, organisation_id.as_bytes(), |key, _| {
            key.owned_by(organisation_id)
        })
    }
}
