//! Tessera Core - Entity Model
//!
//! Records, keys, link snapshots, the type registry and the error taxonomy.
//! No I/O happens here; every other crate depends on this one.

use chrono::{DateTime, Utc};

pub mod change;
pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod keys;
pub mod links;
pub mod record;
pub mod registry;

pub use change::{ChangeRecord, ChangeSink};
pub use config::{EngineConfig, TierConfig};
pub use entity::{Entity, EntityMeta, Provenance};
pub use error::{ConfigError, StorageError, TesseraError, TesseraResult, ValidationError};
pub use identity::{IdGenerator, UuidV7Generator};
pub use keys::{ParallelShape, PointKey, QueryKey, QueryShape};
pub use links::{LinkDiff, LinkMap};
pub use record::{IndexValues, RawRecord, Record, RecordRef, WriteRecord};
pub use registry::{
    parallel_hash, HashLocator, Locator, PrefixHashLocator, TypeDescriptor, TypeRegistration,
    TypeRegistry,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Reserved pseudo-tenant whose records every tenant can read.
pub const DEFAULT_GLOBAL_ORGANISATION: &str = "global";

/// Separates an organisation id from a hash-partition suffix.
pub const PARTITION_SEPARATOR: char = '#';

/// Reject organisation ids that would collide with hashed partitions.
pub fn validate_organisation(organisation_id: &str) -> TesseraResult<()> {
    if organisation_id.is_empty() || organisation_id.contains(PARTITION_SEPARATOR) {
        return Err(ValidationError::ReservedOrganisation {
            organisation_id: organisation_id.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Physical partition for an organisation, with an optional hash suffix.
pub fn partition_key(organisation_id: &str, hash_part: Option<&str>) -> String {
    match hash_part {
        Some(hash) => format!("{organisation_id}{PARTITION_SEPARATOR}{hash}"),
        None => organisation_id.to_string(),
    }
}

/// Split a physical partition into organisation id and hash suffix.
pub fn split_partition(partition: &str) -> (&str, Option<&str>) {
    match partition.split_once(PARTITION_SEPARATOR) {
        Some((org, hash)) => (org, Some(hash)),
        None => (partition, None),
    }
}

/// Physical sort key: `"{type}:{localId}"`.
pub fn sort_key(type_name: &str, id: &str) -> String {
    format!("{type_name}:{id}")
}

/// Inverse of [`sort_key`].
pub fn split_sort_key(sort_key: &str) -> Option<(&str, &str)> {
    sort_key.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_organisation() {
        assert!(validate_organisation("acme").is_ok());
        assert!(validate_organisation("").is_err());
        assert!(matches!(
            validate_organisation("acme#01"),
            Err(TesseraError::Validation(ValidationError::ReservedOrganisation { .. }))
        ));
    }

    #[test]
    fn test_partition_key_with_hash() {
        assert_eq!(partition_key("acme", None), "acme");
        assert_eq!(partition_key("acme", Some("ab")), "acme#ab");
        assert_eq!(split_partition("acme#ab"), ("acme", Some("ab")));
        assert_eq!(split_partition("acme"), ("acme", None));
    }

    #[test]
    fn test_sort_key_keeps_colons_in_id() {
        let key = sort_key("widget", "a:b");
        assert_eq!(split_sort_key(&key), Some(("widget", "a:b")));
    }
}
