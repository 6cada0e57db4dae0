//! Point and query keys.
//!
//! Both are plain values with structural equality so the request cache can
//! coalesce identical lookups issued within one unit of work.

use serde::{Deserialize, Serialize};

/// Identity of a single-record lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointKey {
    pub organisation_id: String,
    pub type_name: String,
    pub id: String,
}

impl PointKey {
    pub fn new(
        organisation_id: impl Into<String>,
        type_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            organisation_id: organisation_id.into(),
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

/// Partitioned fan-out request: split a scan into `shard_count` concurrent
/// segments grouped by the declared parallel key `grouping_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelShape {
    pub shard_count: u32,
    pub grouping_key: String,
}

/// Shape of a prefix scan: `startsWith`, exclusive `after` cursor, `limit`,
/// and optional `parallel` fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryShape {
    pub starts_with: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
    pub parallel: Option<ParallelShape>,
}

impl QueryShape {
    /// Unfiltered shape: every record of the type.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn starts_with(mut self, prefix: impl Into<String>) -> Self {
        self.starts_with = Some(prefix.into());
        self
    }

    /// Only ids strictly greater than `cursor`.
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn parallel(mut self, shard_count: u32, grouping_key: impl Into<String>) -> Self {
        self.parallel = Some(ParallelShape {
            shard_count,
            grouping_key: grouping_key.into(),
        });
        self
    }

    /// The id prefix to scan, empty when unfiltered.
    pub fn prefix(&self) -> &str {
        self.starts_with.as_deref().unwrap_or("")
    }

    pub fn is_unfiltered(&self) -> bool {
        self.prefix().is_empty()
    }
}

/// Identity of one prefix scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    pub organisation_id: String,
    pub type_name: String,
    pub shape: QueryShape,
}

impl QueryKey {
    pub fn new(
        organisation_id: impl Into<String>,
        type_name: impl Into<String>,
        shape: QueryShape,
    ) -> Self {
        Self {
            organisation_id: organisation_id.into(),
            type_name: type_name.into(),
            shape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_point_key_value_equality() {
        let a = PointKey::new("org", "widget", "1");
        let b = PointKey::new("org", "widget", "1");
        let c = PointKey::new("org", "widget", "2");
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_query_shape_builder() {
        let shape = QueryShape::all()
            .starts_with("ab")
            .after("ab1")
            .limit(10)
            .parallel(4, "region");
        assert_eq!(shape.prefix(), "ab");
        assert_eq!(shape.after.as_deref(), Some("ab1"));
        assert_eq!(shape.limit, Some(10));
        assert_eq!(shape.parallel.as_ref().map(|p| p.shard_count), Some(4));
        assert!(!shape.is_unfiltered());
        assert!(QueryShape::all().is_unfiltered());
    }

    #[test]
    fn test_query_keys_differ_by_shape() {
        let a = QueryKey::new("org", "widget", QueryShape::all());
        let b = QueryKey::new("org", "widget", QueryShape::all().limit(1));
        assert_ne!(a, b);
    }
}
