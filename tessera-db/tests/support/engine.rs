use std::sync::Arc;

use tessera_db::{Engine, EngineConfig};
use tessera_test_utils::{fixture_registry, MemoryKvStore};

pub fn test_engine(store: &Arc<MemoryKvStore>, config: EngineConfig) -> Engine {
    Engine::builder(store.clone())
        .config(config)
        .registry(fixture_registry())
        .build()
        .expect("Failed to build test engine")
}
