use std::sync::Arc;

use redshift_config::shared::LoaderConfig;
use uuid::Uuid;

use crate::schema::cache::SchemaCache;

/// Shared state of one run, created once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct EngineContext<W, S> {
    pub config: Arc<LoaderConfig>,
    pub warehouse: W,
    pub staging: S,
    pub schema_cache: SchemaCache,
    /// Distinguishes staged objects of concurrent runs.
    pub run_id: Uuid,
}

impl<W, S> EngineContext<W, S> {
    pub fn new(config: LoaderConfig, warehouse: W, staging: S) -> Self {
        Self {
            config: Arc::new(config),
            warehouse,
            staging,
            schema_cache: SchemaCache::new(),
            run_id: Uuid::new_v4(),
        }
    }
}
