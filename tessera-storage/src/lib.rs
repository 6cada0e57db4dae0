//! Tessera Storage - Tiered Driver and Request Cache
//!
//! Maps the canonical record model onto an ordered list of sorted key-value
//! tables ("tiers"). Reads climb every tier for the caller's tenant and the
//! global pseudo-tenant and merge through the [`flatten`] rules; writes land
//! only in the active tier under a revision precondition. Links are kept
//! symmetric by writing both endpoints.
//!
//! The [`cache`] module batches and memoises reads for one unit of work.

pub mod backup;
pub mod cache;
pub mod codec;
pub mod driver;
pub mod flatten;
pub mod kv;
mod link;

pub use backup::BackupItem;
pub use cache::{Dispatcher, PointCache, QueryCache};
pub use driver::{LinkOutcome, StorageDriver, TieredDriver};
pub use flatten::{flatten, flatten_all};
pub use kv::{
    Clause, Condition, IndexKind, Item, ItemKey, KvResult, KvStore, LmdbKvStore, MemoryKvStore,
    ScanPage, ScanRequest, ShardFilter, UpdateAction,
};
