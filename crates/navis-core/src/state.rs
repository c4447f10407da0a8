//! Shared engine state handed to the RPC layer and CLI commands.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::manager::WorkflowManager;
use crate::registry::WorkflowRegistry;
use crate::storage::{SqliteStorage, WorkflowStorage};

pub struct EngineStateInner {
    pub manager: WorkflowManager,
    pub config: EngineConfig,
}

pub type EngineState = Arc<EngineStateInner>;

impl EngineStateInner {
    pub fn new(registry: WorkflowRegistry, storage: Arc<dyn WorkflowStorage>, config: EngineConfig) -> Self {
        Self {
            manager: WorkflowManager::new(Arc::new(registry), storage),
            config,
        }
    }

    /// State backed by the SQLite database named in `config`.
    pub fn open(registry: WorkflowRegistry, config: EngineConfig) -> Result<Self> {
        let storage = SqliteStorage::open(&config.db_path)?;
        Ok(Self::new(registry, Arc::new(storage), config))
    }
}
