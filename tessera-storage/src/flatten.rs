//! Tier merge.
//!
//! Raw records for one logical id are folded in ascending specificity:
//! tier first, and within a tier the global pseudo-tenant before the
//! caller's own tenant. Rules:
//!
//! - a payload-bearing record replaces payload, timestamps, revision,
//!   indexes and provenance
//! - a payload-less shadow only overlays its non-empty link sets and can
//!   raise, never lower, the revision
//! - any tombstone removes the id outright, whatever its specificity;
//!   a put at the tombstone's own location is what revives the id
//! - a fold that never saw a payload yields nothing

use std::collections::BTreeMap;

use tessera_core::{record::epoch, IndexValues, LinkMap, Provenance, RawRecord, Record};

fn specificity(record: &RawRecord, global_organisation: &str) -> (usize, bool) {
    (record.tier, record.organisation_id != global_organisation)
}

struct Payload {
    item: serde_json::Value,
    revision: u64,
    created_at: Option<tessera_core::Timestamp>,
    updated_at: Option<tessera_core::Timestamp>,
    provenance: Provenance,
    indexes: IndexValues,
}

/// Merge every raw record of one logical id.
pub fn flatten(mut records: Vec<RawRecord>, global_organisation: &str) -> Option<Record> {
    records.sort_by_key(|r| specificity(r, global_organisation));

    let first = records.first()?;
    let type_name = first.type_name.clone();
    let id = first.id.clone();

    let mut payload: Option<Payload> = None;
    let mut links = LinkMap::new();
    let mut shadow_revision = 0u64;

    for record in records {
        if record.deleted {
            return None;
        }
        links = links.merge_overlay(&record.links);
        match record.item {
            Some(item) => {
                payload = Some(Payload {
                    item,
                    revision: record.revision,
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                    provenance: Provenance {
                        tier: record.tier,
                        organisation_id: record.organisation_id,
                    },
                    indexes: record.indexes,
                });
            }
            None => shadow_revision = shadow_revision.max(record.revision),
        }
    }

    let payload = payload?;
    let created_at = payload.created_at.unwrap_or_else(epoch);
    Some(Record {
        type_name,
        id,
        item: payload.item,
        links,
        revision: payload.revision.max(shadow_revision),
        created_at,
        updated_at: payload.updated_at.unwrap_or(created_at),
        provenance: payload.provenance,
        indexes: payload.indexes,
    })
}

/// Group raw records by logical `(type, id)`, merge each group and return the
/// survivors sorted by id.
pub fn flatten_all(records: Vec<RawRecord>, global_organisation: &str) -> Vec<Record> {
    let mut groups: BTreeMap<(String, String), Vec<RawRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.id.clone(), record.type_name.clone()))
            .or_default()
            .push(record);
    }
    groups
        .into_values()
        .filter_map(|group| flatten(group, global_organisation))
        .collect()
}
