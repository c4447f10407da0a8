//! SQLite connection handle for the workflow tables.
//!
//! One connection is shared behind a mutex. Async callers go through
//! [`Database::with_conn_async`], which moves the work onto tokio's blocking
//! pool. File databases run in WAL mode so readers never wait on a batch.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::WorkflowError;

/// Bumped whenever [`SCHEMA`] changes shape.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow (
    id              TEXT PRIMARY KEY,
    "key"           TEXT NOT NULL,
    revision        INTEGER NOT NULL,
    title           TEXT NOT NULL,
    namespace       TEXT,
    resource_name   TEXT NOT NULL,
    resource_id     TEXT NOT NULL,
    status          TEXT NOT NULL,
    paused          TEXT,
    progress        REAL NOT NULL DEFAULT 0,
    label           TEXT,
    params          TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    ts_start        TEXT,
    ts_finish       TEXT
);
CREATE INDEX IF NOT EXISTS idx_workflow_resource
    ON workflow("key", resource_name, resource_id);

CREATE TABLE IF NOT EXISTS workflow_step (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    step_key        TEXT NOT NULL,
    title           TEXT NOT NULL,
    stage_key       TEXT NOT NULL,
    "index"         INTEGER NOT NULL DEFAULT 0,
    selector        TEXT NOT NULL,
    label           TEXT NOT NULL,
    status          TEXT NOT NULL,
    src_step        TEXT,
    message         TEXT,
    ts_start        TEXT NOT NULL,
    ts_finish       TEXT
);
CREATE INDEX IF NOT EXISTS idx_workflow_step_workflow ON workflow_step(workflow_id);

CREATE TABLE IF NOT EXISTS workflow_stage (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    "key"           TEXT NOT NULL,
    title           TEXT NOT NULL,
    "order"         INTEGER NOT NULL,
    stage_type      TEXT NOT NULL,
    "desc"          TEXT,
    status          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_stage_workflow ON workflow_stage(workflow_id);

CREATE TABLE IF NOT EXISTS workflow_memory (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    step_id         TEXT,
    memory          TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_workflow_memory_workflow ON workflow_memory(workflow_id);

CREATE TABLE IF NOT EXISTS workflow_participant (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_participant_workflow
    ON workflow_participant(workflow_id);

CREATE TABLE IF NOT EXISTS workflow_mutation (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    transaction_id  TEXT NOT NULL,
    kind            TEXT NOT NULL,
    action          TEXT NOT NULL,
    step_id         TEXT,
    "order"         INTEGER NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_mutation_workflow ON workflow_mutation(workflow_id);

CREATE TABLE IF NOT EXISTS workflow_activity (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    transaction_id  TEXT NOT NULL,
    name            TEXT NOT NULL,
    args            TEXT NOT NULL DEFAULT 'null',
    step_id         TEXT,
    "order"         INTEGER NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_message (
    id              TEXT PRIMARY KEY,
    workflow_id     TEXT NOT NULL REFERENCES workflow(id) ON DELETE CASCADE,
    transaction_id  TEXT NOT NULL,
    step_id         TEXT,
    source          TEXT NOT NULL,
    content         TEXT NOT NULL,
    "order"         INTEGER NOT NULL,
    created_at      TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database file. `":memory:"` opens an in-process database.
    pub fn open(db_path: &str) -> Result<Self, WorkflowError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WorkflowError::Storage(format!("Cannot create directory for '{}': {}", db_path, e))
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| WorkflowError::Storage(format!("Cannot open '{}': {}", db_path, e)))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = db_path, mode = %mode, "WAL journal mode unavailable");
        }
        let db = Self::prepare(conn)?;
        tracing::info!(path = db_path, "Opened workflow database");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, WorkflowError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, WorkflowError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(WorkflowError::Storage(format!(
                "Database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tracing::debug!(from = version, to = SCHEMA_VERSION, "Migrated workflow schema");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the current thread.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(&Connection) -> Result<T, WorkflowError>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| WorkflowError::Storage("Database connection lock poisoned".into()))?;
        f(&guard)
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(&Connection) -> Result<T, WorkflowError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        match tokio::task::spawn_blocking(move || db.with_conn(f)).await {
            Ok(result) => result,
            Err(e) => Err(WorkflowError::Storage(format!("Database task failed: {}", e))),
        }
    }

    pub fn schema_version(&self) -> Result<i64, WorkflowError> {
        self.with_conn(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
    }
}
