//! Engine configuration.
//!
//! Hosts start from defaults, layer the environment (`NAVIS_DB_PATH`,
//! `NAVIS_NAMESPACE`) on top with [`EngineConfig::with_env`], then apply
//! their own overrides. The CLI does this with its `--db` and `--namespace`
//! flags.

use serde::{Deserialize, Serialize};

pub const DB_PATH_ENV: &str = "NAVIS_DB_PATH";
pub const NAMESPACE_ENV: &str = "NAVIS_NAMESPACE";

/// Runtime configuration shared by hosts embedding the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// SQLite database file. `":memory:"` keeps everything in process.
    pub db_path: String,
    /// Namespace assigned to definitions that do not declare one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "navis.db".to_string(),
            namespace: None,
        }
    }
}

impl EngineConfig {
    /// Apply environment variables over this config. Unset or blank
    /// variables keep the current values.
    pub fn with_env(self) -> Self {
        self.with_lookup(|name| std::env::var(name).ok())
    }

    fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(db_path) = present(DB_PATH_ENV) {
            self.db_path = db_path;
        }
        if let Some(namespace) = present(NAMESPACE_ENV) {
            self.namespace = Some(namespace);
        }
        self
    }

    pub fn with_db_path(mut self, db_path: impl Into<String>) -> Self {
        self.db_path = db_path.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }
}
