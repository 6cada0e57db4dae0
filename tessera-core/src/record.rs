//! Untyped record views shared by the driver, the cache and the façade.
//!
//! - [`RawRecord`]: one tier's physical view of a logical id.
//! - [`Record`]: the merged, canonical view across every probed tier.
//! - [`WriteRecord`] / [`RecordRef`]: what a put, resp. a delete or link,
//!   needs to know about the caller's entity.

use chrono::DateTime;
use serde_json::Value;

use crate::entity::{Entity, EntityMeta, Provenance};
use crate::error::{TesseraResult, ValidationError};
use crate::keys::PointKey;
use crate::links::LinkMap;
use crate::Timestamp;

/// Precomputed index attribute values for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexValues {
    /// `"{type}:{value}"` for the per-tenant index.
    pub secondary: Option<String>,
    /// `"{type}:{value}"` for the cross-tenant index.
    pub global: Option<String>,
    /// Stable hash of the declared parallel grouping value.
    pub parallel_hash: Option<u64>,
}

/// One tier's physical view of a logical id.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub tier: usize,
    /// Logical owner, with any hash-partition suffix removed.
    pub organisation_id: String,
    pub type_name: String,
    pub id: String,
    /// `None` for link-only shadow items and tombstones.
    pub item: Option<Value>,
    pub links: LinkMap,
    pub revision: u64,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub deleted: bool,
    pub hashed: bool,
    pub indexes: IndexValues,
}

/// Canonical record for one logical id.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub type_name: String,
    pub id: String,
    pub item: Value,
    pub links: LinkMap,
    pub revision: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub provenance: Provenance,
    pub indexes: IndexValues,
}

impl Record {
    pub fn point_key(&self, organisation_id: &str) -> PointKey {
        PointKey::new(organisation_id, &self.type_name, &self.id)
    }

    pub fn to_ref(&self) -> RecordRef {
        RecordRef {
            type_name: self.type_name.clone(),
            id: self.id.clone(),
            revision: self.revision,
            links: self.links.clone(),
            provenance: Some(self.provenance.clone()),
        }
    }

    /// Rehydrate a typed entity, stamping the engine fields.
    pub fn into_entity<T: Entity>(self) -> TesseraResult<T> {
        if self.type_name != T::TYPE {
            return Err(ValidationError::InvalidValue {
                field: "type".to_string(),
                reason: format!("expected {}, got {}", T::TYPE, self.type_name),
            }
            .into());
        }
        let mut entity: T = serde_json::from_value(self.item)?;
        *entity.meta_mut() = EntityMeta::stamped(
            self.id,
            self.revision,
            self.created_at,
            self.updated_at,
            self.links,
            self.provenance,
        );
        Ok(entity)
    }
}

/// What deletes and links need to know about the caller's copy of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRef {
    pub type_name: String,
    pub id: String,
    /// Revision the caller holds.
    pub revision: u64,
    /// Link snapshot the caller holds.
    pub links: LinkMap,
    pub provenance: Option<Provenance>,
}

impl RecordRef {
    /// Reference to a typed entity. Fails if the entity has never been put.
    pub fn of<T: Entity>(entity: &T) -> TesseraResult<Self> {
        let meta = entity.meta();
        let id = meta.id.clone().ok_or_else(|| ValidationError::RequiredFieldMissing {
            field: format!("{}.id", T::TYPE),
        })?;
        Ok(Self {
            type_name: T::TYPE.to_string(),
            id,
            revision: meta.revision,
            links: meta.links().clone(),
            provenance: meta.provenance().cloned(),
        })
    }
}

/// A put request for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub type_name: String,
    pub id: Option<String>,
    /// Opaque payload, engine fields excluded.
    pub item: Value,
    pub revision: u64,
    pub created_at: Option<Timestamp>,
    pub links: LinkMap,
    pub provenance: Option<Provenance>,
    pub indexes: IndexValues,
}

impl WriteRecord {
    /// Build the typed result of an accepted write from the caller's entity.
    pub fn stamp_onto<T: Entity>(entity: &T, record: &Record) -> T {
        let mut next = entity.clone();
        *next.meta_mut() = EntityMeta::stamped(
            record.id.clone(),
            record.revision,
            record.created_at,
            record.updated_at,
            record.links.clone(),
            record.provenance.clone(),
        );
        next
    }
}

/// Fallback for timestamps missing from hand-restored items.
pub fn epoch() -> Timestamp {
    DateTime::UNIX_EPOCH
}
