//! Sorted key-value store contract.
//!
//! Items are attribute bags (`serde_json::Map`) addressed by a partition key
//! and a sort key, both carried inside the item itself as `organisationId`
//! and `id`. Every write takes a [`Condition`] evaluated atomically against
//! the current item; a failed check returns the current image so the caller
//! can tell a revision mismatch from a missing links map.
//!
//! The evaluation rules live here so every backend agrees on them.

pub mod lmdb;
pub mod memory;

pub use lmdb::LmdbKvStore;
pub use memory::MemoryKvStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tessera_core::{StorageError, PARTITION_SEPARATOR};

use crate::codec::attr;

/// One stored attribute bag.
pub type Item = Map<String, Value>;

/// Result type for store operations.
pub type KvResult<T> = Result<T, StorageError>;

/// Physical address of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub partition: String,
    pub sort_key: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort_key: sort_key.into(),
        }
    }

    /// Read the key attributes out of an item.
    pub fn of(item: &Item) -> KvResult<Self> {
        let field = |name: &str| {
            item.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StorageError::Codec {
                    key: format!("{:?}", item.get(attr::SORT_KEY)),
                    reason: format!("missing key attribute {name}"),
                })
        };
        Ok(Self {
            partition: field(attr::PARTITION_KEY)?,
            sort_key: field(attr::SORT_KEY)?,
        })
    }

    /// Whether this key lives in `organisation_id`'s partition or one of its
    /// hashed sub-partitions.
    pub fn owned_by(&self, organisation_id: &str) -> bool {
        partition_owned_by(&self.partition, organisation_id)
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort_key)
    }
}

pub(crate) fn partition_owned_by(partition: &str, organisation_id: &str) -> bool {
    partition == organisation_id
        || partition
            .strip_prefix(organisation_id)
            .is_some_and(|rest| rest.starts_with(PARTITION_SEPARATOR))
}

/// Which secondary index to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// `secondaryGlobal`, across every partition.
    Global,
    /// `secondaryOrganisation`, within one tenant.
    Organisation,
}

impl IndexKind {
    pub fn attribute(self) -> &'static str {
        match self {
            IndexKind::Global => attr::SECONDARY_GLOBAL,
            IndexKind::Organisation => attr::SECONDARY_ORGANISATION,
        }
    }
}

/// Segment of a partitioned parallel scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardFilter {
    pub shard: u32,
    pub count: u32,
}

impl ShardFilter {
    /// Items without a `parallelHash` belong to shard 0.
    pub fn matches(&self, item: &Item) -> bool {
        let hash = item.get(attr::PARALLEL_HASH).and_then(Value::as_u64);
        match hash {
            Some(hash) => hash % u64::from(self.count.max(1)) == u64::from(self.shard),
            None => self.shard == 0,
        }
    }
}

/// One page of a prefix scan within a single partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub partition: String,
    pub prefix: String,
    /// Exclusive sort-key cursor.
    pub after: Option<String>,
    /// Items evaluated per page, before the shard filter.
    pub limit: usize,
    pub shard: Option<ShardFilter>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// Set when the page was cut short; pass it as the next `after`.
    pub last_evaluated: Option<String>,
}

/// Conjunction of clauses checked against the current item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Stored revision equals the value; a missing item counts as 0.
    RevisionEquals(u64),
    /// Stored revision is at most the value; a missing item counts as 0.
    RevisionAtMost(u64),
    /// No item, or an item without a payload (link-only shadow, tombstone).
    NoPayload,
    LinksExist,
    LinksAbsent,
}

impl Condition {
    /// Always passes.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_satisfied_by(&self, current: Option<&Item>) -> bool {
        self.clauses.iter().all(|clause| clause.is_satisfied_by(current))
    }

    /// Check against `current`, producing the store's failure on a miss.
    pub fn check(&self, table: &str, current: Option<&Item>) -> KvResult<()> {
        if self.is_satisfied_by(current) {
            Ok(())
        } else {
            Err(StorageError::ConditionFailed {
                table: table.to_string(),
                current: current.cloned(),
            })
        }
    }
}

impl Clause {
    fn is_satisfied_by(&self, current: Option<&Item>) -> bool {
        match self {
            Clause::RevisionEquals(expected) => stored_revision(current) == *expected,
            Clause::RevisionAtMost(bound) => stored_revision(current) <= *bound,
            Clause::NoPayload => !has_payload(current),
            Clause::LinksExist => has_links(current),
            Clause::LinksAbsent => !has_links(current),
        }
    }
}

/// Revision attribute of an item, 0 when absent.
pub fn stored_revision(item: Option<&Item>) -> u64 {
    item.and_then(|i| i.get(attr::REVISION))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

pub fn has_payload(item: Option<&Item>) -> bool {
    item.and_then(|i| i.get(attr::ITEM))
        .is_some_and(|v| !v.is_null())
}

fn has_links(item: Option<&Item>) -> bool {
    item.and_then(|i| i.get(attr::LINKS))
        .is_some_and(Value::is_object)
}

/// One clause of an update expression.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set { attribute: String, value: Value },
    Remove { attribute: String },
    /// Add to a numeric attribute after raising it to at least `floor`.
    /// Absence counts as 0.
    Increment { attribute: String, by: u64, floor: u64 },
    /// Add one id to `links.{type}`. Needs the links map.
    AddLink { type_name: String, id: String },
    /// Remove one id from `links.{type}`, dropping the set once empty.
    /// Needs the links map.
    RemoveLink { type_name: String, id: String },
    /// Replace `links.{type}`. Needs the links map.
    SetLinkSet { type_name: String, ids: Vec<String> },
    /// Drop `links.{type}`. Needs the links map.
    RemoveLinkSet { type_name: String },
}

impl UpdateAction {
    pub fn set(attribute: &str, value: impl Into<Value>) -> Self {
        UpdateAction::Set {
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }

    pub fn remove(attribute: &str) -> Self {
        UpdateAction::Remove {
            attribute: attribute.to_string(),
        }
    }

    pub fn increment(attribute: &str) -> Self {
        Self::increment_past(attribute, 0)
    }

    /// `max(current, floor) + 1`.
    pub fn increment_past(attribute: &str, floor: u64) -> Self {
        UpdateAction::Increment {
            attribute: attribute.to_string(),
            by: 1,
            floor,
        }
    }
}

/// Apply `actions` to `current`, creating the item if absent.
pub fn apply_updates(key: &ItemKey, current: Option<Item>, actions: &[UpdateAction]) -> KvResult<Item> {
    let mut item = current.unwrap_or_default();
    item.insert(attr::PARTITION_KEY.to_string(), Value::String(key.partition.clone()));
    item.insert(attr::SORT_KEY.to_string(), Value::String(key.sort_key.clone()));

    for action in actions {
        match action {
            UpdateAction::Set { attribute, value } => {
                item.insert(attribute.clone(), value.clone());
            }
            UpdateAction::Remove { attribute } => {
                item.remove(attribute);
            }
            UpdateAction::Increment {
                attribute,
                by,
                floor,
            } => {
                let current = item.get(attribute).and_then(Value::as_u64).unwrap_or(0);
                item.insert(attribute.clone(), Value::from(current.max(*floor) + by));
            }
            UpdateAction::AddLink { type_name, id } => {
                let links = links_mut(key, &mut item)?;
                let mut ids = link_ids(links.get(type_name));
                if !ids.contains(id) {
                    ids.push(id.clone());
                    ids.sort();
                }
                links.insert(type_name.clone(), ids.into());
            }
            UpdateAction::RemoveLink { type_name, id } => {
                let links = links_mut(key, &mut item)?;
                let ids: Vec<String> = link_ids(links.get(type_name))
                    .into_iter()
                    .filter(|existing| existing != id)
                    .collect();
                if ids.is_empty() {
                    links.remove(type_name);
                } else {
                    links.insert(type_name.clone(), ids.into());
                }
            }
            UpdateAction::SetLinkSet { type_name, ids } => {
                let links = links_mut(key, &mut item)?;
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                links.insert(type_name.clone(), ids.into());
            }
            UpdateAction::RemoveLinkSet { type_name } => {
                links_mut(key, &mut item)?.remove(type_name);
            }
        }
    }

    Ok(item)
}

fn links_mut<'a>(key: &ItemKey, item: &'a mut Item) -> KvResult<&'a mut Map<String, Value>> {
    match item.get_mut(attr::LINKS) {
        Some(Value::Object(links)) => Ok(links),
        _ => Err(StorageError::InvalidUpdate {
            key: key.to_string(),
            reason: "document path links does not exist".to_string(),
        }),
    }
}

fn link_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Backend storing attribute bags in named tables.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch the items that exist among `keys`, in no particular order.
    async fn batch_get(&self, table: &str, keys: &[ItemKey]) -> KvResult<Vec<Item>>;

    /// One page of a prefix scan within one partition, in sort-key order.
    async fn query(&self, table: &str, request: ScanRequest) -> KvResult<ScanPage>;

    /// Items whose `kind` index attribute equals `value`, optionally limited
    /// to one organisation's partitions.
    async fn query_index(
        &self,
        table: &str,
        kind: IndexKind,
        value: &str,
        organisation_id: Option<&str>,
    ) -> KvResult<Vec<Item>>;

    /// Replace the whole item.
    async fn put(&self, table: &str, item: Item, condition: Condition) -> KvResult<()>;

    /// Apply `actions`, creating the item if absent. Returns the new image.
    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[UpdateAction],
        condition: Condition,
    ) -> KvResult<Item>;

    /// Returns whether an item was removed.
    async fn delete(&self, table: &str, key: &ItemKey, condition: Condition) -> KvResult<bool>;

    /// Every item in the organisation's partition and its hashed
    /// sub-partitions.
    async fn scan_owned(&self, table: &str, organisation_id: &str) -> KvResult<Vec<Item>>;
}
