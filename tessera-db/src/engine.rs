//! Engine wiring: one shared storage driver, many tenant databases.

use std::sync::Arc;

use tessera_core::{
    ChangeSink, ConfigError, EngineConfig, IdGenerator, TesseraResult, TypeRegistry,
};
use tessera_storage::{BackupItem, KvStore, StorageDriver, TieredDriver};
use tracing::info;

use crate::auth::{AllowAll, WriteAuthorizer};
use crate::batch::WriteBuffer;
use crate::database::Database;

/// Shared, cheaply cloneable handle to a configured store.
#[derive(Clone)]
pub struct Engine {
    driver: Arc<dyn StorageDriver>,
    config: EngineConfig,
    authorizer: Arc<dyn WriteAuthorizer>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder<S: KvStore>(store: Arc<S>) -> EngineBuilder<S> {
        EngineBuilder::new(store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn driver(&self) -> Arc<dyn StorageDriver> {
        Arc::clone(&self.driver)
    }

    /// A fresh unit of work for `organisation_id`.
    pub fn database(&self, organisation_id: impl Into<String>) -> TesseraResult<Database> {
        Database::new(
            organisation_id,
            self.driver(),
            Arc::clone(&self.authorizer),
            self.config.flush_interval(),
        )
    }

    pub fn write_buffer(&self) -> WriteBuffer {
        WriteBuffer::new(self.driver(), Arc::clone(&self.authorizer))
    }

    pub async fn take_backup(&self, organisation_id: &str) -> TesseraResult<Vec<BackupItem>> {
        self.driver.take_backup(organisation_id).await
    }

    pub async fn restore_backup(
        &self,
        organisation_id: &str,
        items: Vec<BackupItem>,
    ) -> TesseraResult<usize> {
        self.driver.restore_backup(organisation_id, items).await
    }

    pub async fn destroy_organisation(&self, organisation_id: &str) -> TesseraResult<usize> {
        self.driver.destroy_organisation(organisation_id).await
    }
}

pub struct EngineBuilder<S> {
    store: Arc<S>,
    config: Option<EngineConfig>,
    registry: TypeRegistry,
    authorizer: Arc<dyn WriteAuthorizer>,
    ids: Option<Arc<dyn IdGenerator>>,
    changes: Option<Arc<dyn ChangeSink>>,
}

impl<S: KvStore> EngineBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: None,
            registry: TypeRegistry::new(),
            authorizer: Arc::new(AllowAll),
            ids: None,
            changes: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn authorizer(mut self, authorizer: impl WriteAuthorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.changes = Some(sink);
        self
    }

    pub fn build(self) -> TesseraResult<Engine> {
        let config = self.config.ok_or_else(|| ConfigError::MissingRequired {
            field: "config".to_string(),
        })?;
        let mut driver = TieredDriver::new(self.store, config.clone(), Arc::new(self.registry))?;
        if let Some(ids) = self.ids {
            driver = driver.with_id_generator(ids);
        }
        if let Some(sink) = self.changes {
            driver = driver.with_change_sink(sink);
        }
        info!(
            tiers = config.tiers.len(),
            active_table = %config.tiers[config.active_tier()].table,
            global_organisation = %config.global_organisation,
            "Engine ready"
        );
        Ok(Engine {
            driver: Arc::new(driver),
            config,
            authorizer: self.authorizer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TesseraError;
    use tessera_storage::MemoryKvStore;

    #[test]
    fn test_build_requires_config() {
        let err = Engine::builder(Arc::new(MemoryKvStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn test_database_rejects_reserved_organisation() {
        let engine = Engine::builder(Arc::new(MemoryKvStore::new()))
            .config(EngineConfig::single("prod"))
            .build()
            .unwrap();
        assert!(engine.database("acme").is_ok());
        assert!(engine.database("acme#01").is_err());
    }
}
