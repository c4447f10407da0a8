//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! engine through `EngineState`.

pub mod definitions;
pub mod event;
pub mod rpc;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use navis_core::{EngineConfig, EngineState, EngineStateInner, WorkflowRegistry};

use crate::demos;

/// Default database location: `<data dir>/navis/navis.db`, or `./navis.db`
/// when the platform has no data directory.
pub fn default_db_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("navis").join("navis.db"))
        .unwrap_or_else(|| PathBuf::from("navis.db"))
        .to_string_lossy()
        .to_string()
}

/// Resolve the engine config: the platform default database, then the
/// `NAVIS_*` environment variables, then explicit flags.
pub fn engine_config(db: Option<String>, namespace: Option<String>) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_db_path(default_db_path())
        .with_env();
    if let Some(db) = db {
        config = config.with_db_path(db);
    }
    if let Some(namespace) = namespace {
        config = config.with_namespace(namespace);
    }
    config
}

/// Build the registry with the bundled definitions and open storage.
pub fn init_state(config: EngineConfig) -> Result<EngineState, String> {
    let mut registry = match &config.namespace {
        Some(ns) => WorkflowRegistry::with_namespace(ns.clone()),
        None => WorkflowRegistry::new(),
    };
    demos::register_demos(&mut registry)
        .map_err(|e| format!("Failed to register workflow definitions: {}", e))?;

    let state = EngineStateInner::open(registry, config.clone())
        .map_err(|e| format!("Failed to open database '{}': {}", config.db_path, e))?;
    Ok(Arc::new(state))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
