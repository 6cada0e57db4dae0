//! Tenant-wide export, import and purge.
//!
//! These bypass the revision protocol entirely: a restore replays physical
//! attribute bags verbatim into a fresh tenant, and a purge removes every
//! item the tenant owns in every tier.

use std::collections::HashSet;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{
    partition_key, split_partition, validate_organisation, StorageError, TesseraResult,
    ValidationError,
};
use tracing::{debug, info};

use crate::codec::attr;
use crate::driver::TieredDriver;
use crate::kv::{Condition, Item, ItemKey, KvResult, KvStore};

/// One physical item of a backup.
///
/// The named fields are the load-bearing wire shape; every other stored
/// attribute (revision, timestamps, tombstone flag, index values) rides
/// along in `attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupItem {
    /// Physical table the item was read from.
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    /// Physical sort key.
    pub id: String,
    /// Physical partition, hash suffix included.
    pub organisation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(default)]
    pub hashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_hash: Option<u64>,
    #[serde(flatten)]
    pub attributes: Item,
}

impl BackupItem {
    pub fn from_item(table: &str, mut item: Item) -> KvResult<Self> {
        let key = ItemKey::of(&item)?;
        item.remove(attr::PARTITION_KEY);
        item.remove(attr::SORT_KEY);
        let payload = item.remove(attr::ITEM).filter(|v| !v.is_null());
        let links = item.remove(attr::LINKS);
        let hashed = item
            .remove(attr::HASHED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let parallel_hash = item.remove(attr::PARALLEL_HASH).and_then(|v| v.as_u64());
        Ok(Self {
            table: table.to_string(),
            item: payload,
            id: key.sort_key,
            organisation_id: key.partition,
            links,
            hashed,
            parallel_hash,
            attributes: item,
        })
    }

    /// Rebuild the physical item under `organisation_id`, keeping any hash
    /// suffix of the original partition.
    pub fn into_item(self, organisation_id: &str) -> Item {
        let (_, hash_part) = split_partition(&self.organisation_id);
        let partition = partition_key(organisation_id, hash_part);

        let mut item = self.attributes;
        item.insert(attr::PARTITION_KEY.to_string(), Value::String(partition));
        item.insert(attr::SORT_KEY.to_string(), Value::String(self.id));
        if let Some(payload) = self.item {
            item.insert(attr::ITEM.to_string(), payload);
        }
        if let Some(links) = self.links {
            item.insert(attr::LINKS.to_string(), links);
        }
        if self.hashed {
            item.insert(attr::HASHED.to_string(), Value::Bool(true));
        }
        if let Some(hash) = self.parallel_hash {
            item.insert(attr::PARALLEL_HASH.to_string(), Value::from(hash));
        }
        item
    }
}

impl<S: KvStore> TieredDriver<S> {
    pub(crate) async fn export_organisation(
        &self,
        organisation_id: &str,
    ) -> TesseraResult<Vec<BackupItem>> {
        validate_organisation(organisation_id)?;
        let mut backup = Vec::new();
        for (tier, table) in self.tables() {
            let items = self.store.scan_owned(table, organisation_id).await?;
            debug!(tier, table, count = items.len(), "Exported tier");
            for item in items {
                backup.push(BackupItem::from_item(table, item)?);
            }
        }
        info!(organisation_id, count = backup.len(), "Backup taken");
        Ok(backup)
    }

    pub(crate) async fn import_organisation(
        &self,
        organisation_id: &str,
        items: Vec<BackupItem>,
    ) -> TesseraResult<usize> {
        validate_organisation(organisation_id)?;
        let tables: HashSet<&str> = self.tables().map(|(_, table)| table).collect();
        if let Some(unknown) = items.iter().find(|b| !tables.contains(b.table.as_str())) {
            return Err(ValidationError::InvalidValue {
                field: "table".to_string(),
                reason: format!("{} is not a configured tier table", unknown.table),
            }
            .into());
        }

        let count = items.len();
        try_join_all(items.into_iter().map(|backup| async move {
            let table = backup.table.clone();
            let item = backup.into_item(organisation_id);
            self.store.put(&table, item, Condition::none()).await
        }))
        .await?;
        info!(organisation_id, count, "Backup restored");
        Ok(count)
    }

    pub(crate) async fn purge_organisation(&self, organisation_id: &str) -> TesseraResult<usize> {
        validate_organisation(organisation_id)?;
        let mut removed = 0;
        for (tier, table) in self.tables() {
            let keys = self
                .store
                .scan_owned(table, organisation_id)
                .await?
                .iter()
                .map(ItemKey::of)
                .collect::<Result<Vec<_>, StorageError>>()?;
            let deleted = try_join_all(
                keys.iter()
                    .map(|key| self.store.delete(table, key, Condition::none())),
            )
            .await?;
            let count = deleted.into_iter().filter(|d| *d).count();
            debug!(tier, table, count, "Purged tier");
            removed += count;
        }
        info!(organisation_id, removed, "Organisation destroyed");
        Ok(removed)
    }
}
