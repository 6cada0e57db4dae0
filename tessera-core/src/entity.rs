//! The record contract every stored type implements.

use serde::{de::DeserializeOwned, Serialize};

use crate::links::LinkMap;
use crate::Timestamp;

/// Which tier and which tenant own the value a caller currently holds.
///
/// Deletes and links consult this to decide whether the caller is acting on
/// its own record or on one inherited from an ancestor tier or from the
/// cross-tenant pseudo-tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provenance {
    /// Index into the configured tier list (0 = least specific).
    pub tier: usize,
    /// Tenant that owns the physical item.
    pub organisation_id: String,
}

/// Engine-managed fields carried alongside every entity.
///
/// Entities keep this in a field marked `#[serde(skip)]`, so serializing the
/// entity yields exactly the opaque payload and never the engine fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMeta {
    /// Assigned by the engine on first put when absent. Immutable once set.
    pub id: Option<String>,
    /// 0 means "does not exist yet".
    pub revision: u64,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    links: LinkMap,
    provenance: Option<Provenance>,
}

impl EntityMeta {
    /// Metadata for a record that has not been written yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for a new record with a caller-chosen id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Metadata as stamped by the engine after a read or an accepted write.
    pub fn stamped(
        id: String,
        revision: u64,
        created_at: Timestamp,
        updated_at: Timestamp,
        links: LinkMap,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: Some(id),
            revision,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
            links,
            provenance: Some(provenance),
        }
    }

    /// Record an accepted link write. Payload-side fields and provenance are
    /// unchanged by a link.
    pub fn apply_link(&mut self, revision: u64, updated_at: Timestamp, links: LinkMap) {
        self.revision = revision;
        self.updated_at = Some(updated_at);
        self.links = links;
    }

    pub fn links(&self) -> &LinkMap {
        &self.links
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.revision > 0
    }
}

/// A typed record stored by the engine.
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Widget {
///     #[serde(skip)]
///     meta: EntityMeta,
///     name: String,
/// }
///
/// impl Entity for Widget {
///     const TYPE: &'static str = "widget";
///     fn meta(&self) -> &EntityMeta { &self.meta }
///     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type tag; also the sort-key prefix and the link relation name.
    const TYPE: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> Option<&str> {
        self.meta().id.as_deref()
    }

    fn revision(&self) -> u64 {
        self.meta().revision
    }

    fn links(&self) -> &LinkMap {
        self.meta().links()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_new_meta_does_not_exist() {
        let meta = EntityMeta::new();
        assert!(!meta.exists());
        assert!(meta.provenance().is_none());
        assert!(meta.links().is_empty());
    }

    #[test]
    fn test_stamped_meta_carries_provenance() {
        let now = Utc::now();
        let meta = EntityMeta::stamped(
            "w1".to_string(),
            3,
            now,
            now,
            LinkMap::new(),
            Provenance {
                tier: 1,
                organisation_id: "org".to_string(),
            },
        );
        assert!(meta.exists());
        assert_eq!(meta.provenance().map(|p| p.tier), Some(1));
    }
}
