//! Tessera Database
//!
//! Typed, tenant-scoped access to the tiered store: the [`Engine`] owns the
//! storage driver, each [`Database`] is one unit of work with its own request
//! cache, and the [`WriteBuffer`] batches puts across tenants.

pub mod auth;
pub mod batch;
pub mod database;
pub mod engine;
pub mod telemetry;

pub use auth::{AllowAll, AuthorizationRequest, WriteAction, WriteAuthorizer};
pub use batch::{PendingWrite, WriteBuffer};
pub use database::Database;
pub use engine::{Engine, EngineBuilder};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

pub use tessera_core::{
    Entity, EntityMeta, EngineConfig, QueryShape, TesseraError, TesseraResult, TypeRegistry,
};
pub use tessera_storage::{BackupItem, LmdbKvStore, MemoryKvStore};
