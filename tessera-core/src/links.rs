//! Link snapshots and link diffs.
//!
//! A record's links are held as an immutable [`LinkMap`] snapshot. Changing a
//! relation never mutates a snapshot in place: the desired id set is compared
//! against the snapshot to produce a [`LinkDiff`], and the storage driver
//! applies that diff to both endpoints.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable map from related-type name to the set of related ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkMap(BTreeMap<String, BTreeSet<String>>);

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids linked under `type_name`. Empty if the relation was never set.
    pub fn ids(&self, type_name: &str) -> BTreeSet<String> {
        self.0.get(type_name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, type_name: &str, id: &str) -> bool {
        self.0.get(type_name).is_some_and(|ids| ids.contains(id))
    }

    /// Related types with at least one id.
    pub fn linked_types(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn has_outgoing(&self) -> bool {
        self.0.values().any(|ids| !ids.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_outgoing()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Returns a new snapshot with `type_name` replaced by `ids`.
    /// An empty `ids` removes the relation.
    pub fn with_type(&self, type_name: &str, ids: BTreeSet<String>) -> Self {
        let mut next = self.0.clone();
        if ids.is_empty() {
            next.remove(type_name);
        } else {
            next.insert(type_name.to_string(), ids);
        }
        Self(next)
    }

    /// Overlay `later` onto this snapshot: every type `later` declares with a
    /// non-empty set replaces ours, everything else is kept.
    pub fn merge_overlay(&self, later: &LinkMap) -> Self {
        let mut next = self.0.clone();
        for (type_name, ids) in &later.0 {
            if !ids.is_empty() {
                next.insert(type_name.clone(), ids.clone());
            }
        }
        Self(next)
    }

    /// Compute the add/remove diff that turns this snapshot's `type_name`
    /// relation into exactly `desired`.
    pub fn diff(&self, type_name: &str, desired: &BTreeSet<String>) -> LinkDiff {
        let current = self.ids(type_name);
        LinkDiff {
            type_name: type_name.to_string(),
            to_add: desired.difference(&current).cloned().collect(),
            to_remove: current.difference(desired).cloned().collect(),
            desired: desired.clone(),
        }
    }
}

impl FromIterator<(String, BTreeSet<String>)> for LinkMap {
    fn from_iter<I: IntoIterator<Item = (String, BTreeSet<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().filter(|(_, ids)| !ids.is_empty()).collect())
    }
}

/// The change a link operation applies to one relation of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDiff {
    pub type_name: String,
    pub desired: BTreeSet<String>,
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl LinkDiff {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Every id whose reverse set changes.
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.to_add.iter().chain(self.to_remove.iter())
    }
}
