//! Attribute codec: the physical item layout.
//!
//! The attribute names below are shared with every other reader of the
//! tables and must not change.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tessera_core::{
    partition_key, sort_key, split_partition, split_sort_key, IndexValues, LinkMap, Locator,
    RawRecord, StorageError, Timestamp, TypeRegistry, WriteRecord,
};

use crate::kv::{Item, ItemKey, KvResult, UpdateAction};

/// Physical attribute names.
pub mod attr {
    pub const PARTITION_KEY: &str = "organisationId";
    pub const SORT_KEY: &str = "id";
    pub const ITEM: &str = "item";
    pub const LINKS: &str = "links";
    pub const REVISION: &str = "revision";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const DELETED: &str = "deleted";
    pub const SECONDARY_GLOBAL: &str = "secondaryGlobal";
    pub const SECONDARY_ORGANISATION: &str = "secondaryOrganisation";
    pub const HASHED: &str = "hashed";
    pub const PARALLEL_HASH: &str = "parallelHash";
}

/// Physical address of a logical id, applying the type's hash locator.
pub fn item_key(
    registry: &TypeRegistry,
    organisation_id: &str,
    type_name: &str,
    id: &str,
) -> KvResult<ItemKey> {
    let locator = registry
        .descriptor(type_name)
        .ok()
        .and_then(|d| d.locator().cloned());
    Ok(match locator {
        Some(locator) => {
            let Locator {
                hash_part,
                sort_part,
            } = locator.locate(id);
            ItemKey::new(
                partition_key(organisation_id, Some(&hash_part)),
                sort_key(type_name, &sort_part),
            )
        }
        None => ItemKey::new(organisation_id, sort_key(type_name, id)),
    })
}

pub fn timestamp_value(ts: &Timestamp) -> Value {
    Value::String(ts.to_rfc3339())
}

pub fn links_value(links: &LinkMap) -> Value {
    let map: Map<String, Value> = links
        .iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(t, ids)| (t.clone(), ids.iter().cloned().collect::<Vec<_>>().into()))
        .collect();
    Value::Object(map)
}

/// Single-relation links map, used to create the map when absent.
pub fn single_link_value(type_name: &str, ids: &[String]) -> Value {
    let mut map = Map::new();
    if !ids.is_empty() {
        map.insert(type_name.to_string(), ids.to_vec().into());
    }
    Value::Object(map)
}

fn set_or_remove(attribute: &str, value: Option<Value>) -> UpdateAction {
    match value {
        Some(value) => UpdateAction::set(attribute, value),
        None => UpdateAction::remove(attribute),
    }
}

/// Update actions writing the payload, timestamps and index attributes of
/// `record`. Links are left alone and the revision is set by the caller.
pub fn payload_actions(
    record: &WriteRecord,
    hashed: bool,
    created_at: Timestamp,
    updated_at: Timestamp,
) -> Vec<UpdateAction> {
    let IndexValues {
        secondary,
        global,
        parallel_hash,
    } = &record.indexes;
    vec![
        UpdateAction::set(attr::ITEM, record.item.clone()),
        UpdateAction::set(attr::CREATED_AT, timestamp_value(&created_at)),
        UpdateAction::set(attr::UPDATED_AT, timestamp_value(&updated_at)),
        UpdateAction::remove(attr::DELETED),
        set_or_remove(attr::SECONDARY_GLOBAL, global.clone().map(Value::String)),
        set_or_remove(
            attr::SECONDARY_ORGANISATION,
            secondary.clone().map(Value::String),
        ),
        set_or_remove(attr::PARALLEL_HASH, parallel_hash.map(Value::from)),
        set_or_remove(attr::HASHED, hashed.then_some(Value::Bool(true))),
    ]
}

/// Update actions turning an item into a tombstone.
pub fn tombstone_actions(updated_at: Timestamp) -> Vec<UpdateAction> {
    vec![
        UpdateAction::remove(attr::ITEM),
        UpdateAction::remove(attr::SECONDARY_GLOBAL),
        UpdateAction::remove(attr::SECONDARY_ORGANISATION),
        UpdateAction::remove(attr::PARALLEL_HASH),
        UpdateAction::set(attr::DELETED, true),
        UpdateAction::set(attr::UPDATED_AT, timestamp_value(&updated_at)),
    ]
}

fn malformed(key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Codec {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_timestamp(key: &str, value: Option<&Value>) -> KvResult<Option<Timestamp>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| malformed(key, e.to_string())),
        Some(other) => Err(malformed(key, format!("timestamp is not a string: {other}"))),
    }
}

fn parse_links(key: &str, value: Option<&Value>) -> KvResult<LinkMap> {
    match value {
        None | Some(Value::Null) => Ok(LinkMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(type_name, ids)| -> KvResult<(String, BTreeSet<String>)> {
                let ids = ids
                    .as_array()
                    .ok_or_else(|| malformed(key, format!("links.{type_name} is not a set")))?
                    .iter()
                    .map(|id| {
                        id.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| malformed(key, "link id is not a string"))
                    })
                    .collect::<KvResult<_>>()?;
                Ok((type_name.clone(), ids))
            })
            .collect(),
        Some(_) => Err(malformed(key, "links is not a map")),
    }
}

/// Decode one physical item read from `tier`.
pub fn decode(registry: &TypeRegistry, tier: usize, item: &Item) -> KvResult<RawRecord> {
    let key = ItemKey::of(item)?;
    let label = key.to_string();
    let (type_name, sort_part) = split_sort_key(&key.sort_key)
        .ok_or_else(|| malformed(&label, "sort key has no type prefix"))?;
    let (organisation_id, hash_part) = split_partition(&key.partition);
    let hashed = item.get(attr::HASHED).and_then(Value::as_bool).unwrap_or(false);

    let id = match (hashed, hash_part) {
        (true, Some(hash_part)) => {
            let locator = registry
                .descriptor(type_name)
                .ok()
                .and_then(|d| d.locator().cloned())
                .ok_or_else(|| malformed(&label, "hashed item of a type without a locator"))?;
            locator.compose(&Locator {
                hash_part: hash_part.to_string(),
                sort_part: sort_part.to_string(),
            })
        }
        (true, None) => return Err(malformed(&label, "hashed item outside a hash partition")),
        (false, _) => sort_part.to_string(),
    };

    let revision = match item.get(attr::REVISION) {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| malformed(&label, "revision is not a non-negative integer"))?,
    };

    Ok(RawRecord {
        tier,
        organisation_id: organisation_id.to_string(),
        type_name: type_name.to_string(),
        id,
        item: item.get(attr::ITEM).filter(|v| !v.is_null()).cloned(),
        links: parse_links(&label, item.get(attr::LINKS))?,
        revision,
        created_at: parse_timestamp(&label, item.get(attr::CREATED_AT))?,
        updated_at: parse_timestamp(&label, item.get(attr::UPDATED_AT))?,
        deleted: item.get(attr::DELETED).and_then(Value::as_bool).unwrap_or(false),
        hashed,
        indexes: IndexValues {
            secondary: item
                .get(attr::SECONDARY_ORGANISATION)
                .and_then(Value::as_str)
                .map(str::to_string),
            global: item
                .get(attr::SECONDARY_GLOBAL)
                .and_then(Value::as_str)
                .map(str::to_string),
            parallel_hash: item.get(attr::PARALLEL_HASH).and_then(Value::as_u64),
        },
    })
}
