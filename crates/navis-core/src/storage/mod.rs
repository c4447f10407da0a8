//! Storage collaborator for workflow state.
//!
//! The engine talks to storage through [`WorkflowStorage`]: two lookups that
//! rebuild a [`WorkflowState`], the last audit `order` of a workflow, and one
//! atomic [`WriteBatch`] application.
//! Records are flat JSON maps keyed by column name, grouped by logical
//! [`Table`].
//!
//! Two implementations ship with the crate:
//! - [`MemoryStorage`] keeps tables in process (tests, ephemeral hosts)
//! - [`SqliteStorage`] persists to SQLite through [`Database`](crate::db::Database)

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::model::{DataMap, Participant, WorkflowStage, WorkflowState, WorkflowStep};

/// Flat key/value row.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Table {
    Workflow,
    WorkflowStep,
    WorkflowMemory,
    WorkflowParticipant,
    WorkflowStage,
    WorkflowMutation,
    WorkflowActivity,
    WorkflowMessage,
}

impl Table {
    /// Audit tables whose rows carry the runner's `order` sequence.
    pub const ORDERED: [Table; 3] = [
        Table::WorkflowMutation,
        Table::WorkflowActivity,
        Table::WorkflowMessage,
    ];

    pub const ALL: [Table; 8] = [
        Table::Workflow,
        Table::WorkflowStep,
        Table::WorkflowMemory,
        Table::WorkflowParticipant,
        Table::WorkflowStage,
        Table::WorkflowMutation,
        Table::WorkflowActivity,
        Table::WorkflowMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Workflow => "workflow",
            Table::WorkflowStep => "workflow-step",
            Table::WorkflowMemory => "workflow-memory",
            Table::WorkflowParticipant => "workflow-participant",
            Table::WorkflowStage => "workflow-stage",
            Table::WorkflowMutation => "workflow-mutation",
            Table::WorkflowActivity => "workflow-activity",
            Table::WorkflowMessage => "workflow-message",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    Insert { table: Table, record: Record },
    /// Apply `changes` to the row with `id`. Missing rows are an error.
    Update { table: Table, id: String, changes: Record },
    /// Insert, or replace the columns of an existing row with the same id.
    Upsert { table: Table, record: Record },
    /// Delete all rows whose columns equal every entry of `filter`.
    Delete { table: Table, filter: Record },
}

/// Ordered operations applied as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<StorageOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: Table, record: Record) {
        self.ops.push(StorageOp::Insert { table, record });
    }

    pub fn update(&mut self, table: Table, id: impl Into<String>, changes: Record) {
        self.ops.push(StorageOp::Update {
            table,
            id: id.into(),
            changes,
        });
    }

    pub fn upsert(&mut self, table: Table, record: Record) {
        self.ops.push(StorageOp::Upsert { table, record });
    }

    pub fn delete(&mut self, table: Table, filter: Record) {
        self.ops.push(StorageOp::Delete { table, filter });
    }

    pub fn ops(&self) -> &[StorageOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Latest instance of `key` bound to the given resource.
    async fn fetch_workflow_state(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
    ) -> Result<Option<WorkflowState>>;

    async fn fetch_workflow_state_by_id(&self, key: &str, id: Uuid) -> Result<Option<WorkflowState>>;

    /// Highest `order` recorded for the workflow across the mutation,
    /// activity and message tables, or 0 when nothing was recorded.
    async fn last_order(&self, workflow_id: Uuid) -> Result<u64>;

    /// Apply every operation or none of them.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}

/// Serialize a value into a flat record, dropping `skip` keys.
pub fn to_record<T: Serialize>(value: &T, skip: &[&str]) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(mut record) => {
            for key in skip {
                record.remove(*key);
            }
            Ok(record)
        }
        other => Err(WorkflowError::InvalidData(format!(
            "Expected an object record, got {}",
            other
        ))),
    }
}

fn from_record<T: serde::de::DeserializeOwned>(record: Record) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

fn record_str<'a>(record: &'a Record, column: &str) -> Option<&'a str> {
    record.get(column).and_then(Value::as_str)
}

/// Rows of one workflow instance, as fetched from any backend.
#[derive(Debug, Default)]
pub struct StateRows {
    pub workflow: Record,
    pub steps: Vec<Record>,
    pub stages: Vec<Record>,
    pub participants: Vec<Record>,
    pub memory: Vec<Record>,
}

/// Rebuild a [`WorkflowState`] with its embedded collections.
pub fn assemble_state(rows: StateRows) -> Result<WorkflowState> {
    let mut state: WorkflowState = from_record(rows.workflow)?;
    state.steps = rows
        .steps
        .into_iter()
        .map(from_record::<WorkflowStep>)
        .collect::<Result<_>>()?;
    state.stages = rows
        .stages
        .into_iter()
        .map(from_record::<WorkflowStage>)
        .collect::<Result<_>>()?;
    state.participants = rows
        .participants
        .into_iter()
        .map(from_record::<Participant>)
        .collect::<Result<_>>()?;

    for row in rows.memory {
        let memory: DataMap = match row.get("memory") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => DataMap::new(),
            Some(other) => {
                return Err(WorkflowError::InvalidData(format!(
                    "Memory of workflow [{}] is not an object: {}",
                    state.id, other
                )))
            }
        };
        match record_str(&row, "step_id") {
            None => state.memory = memory,
            Some(step_id) => {
                if let Some(step) = state.steps.iter_mut().find(|s| s.id.to_string() == step_id) {
                    step.memory = memory;
                }
            }
        }
    }
    Ok(state)
}
