use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{assemble_state, record_str, Record, StateRows, StorageOp, Table, WorkflowStorage, WriteBatch};
use crate::error::{Result, WorkflowError};
use crate::model::WorkflowState;

type Tables = HashMap<Table, Vec<Record>>;

/// In-process storage. Batches are applied to a copy of the tables and
/// swapped in only when every operation succeeded.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's rows, in insertion order.
    pub async fn rows(&self, table: Table) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, table: Table) -> usize {
        self.tables
            .read()
            .await
            .get(&table)
            .map_or(0, Vec::len)
    }

    async fn fetch_where<F>(&self, matches: F) -> Result<Option<WorkflowState>>
    where
        F: Fn(&Record) -> bool,
    {
        let tables = self.tables.read().await;
        let workflow = match tables
            .get(&Table::Workflow)
            .and_then(|rows| rows.iter().rev().find(|r| matches(r)))
        {
            Some(row) => row.clone(),
            None => return Ok(None),
        };
        let id = record_str(&workflow, "id").unwrap_or_default().to_string();
        let children = |table: Table| -> Vec<Record> {
            tables
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| record_str(r, "workflow_id") == Some(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        let rows = StateRows {
            steps: children(Table::WorkflowStep),
            stages: children(Table::WorkflowStage),
            participants: children(Table::WorkflowParticipant),
            memory: children(Table::WorkflowMemory),
            workflow,
        };
        assemble_state(rows).map(Some)
    }
}

fn row_id(record: &Record, table: Table) -> Result<String> {
    record_str(record, "id").map(String::from).ok_or_else(|| {
        WorkflowError::Storage(format!("Record for table [{}] has no id", table.as_str()))
    })
}

fn apply_op(tables: &mut Tables, op: StorageOp) -> Result<()> {
    match op {
        StorageOp::Insert { table, record } => {
            let id = row_id(&record, table)?;
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|r| record_str(r, "id") == Some(id.as_str())) {
                return Err(WorkflowError::Storage(format!(
                    "Duplicate id [{}] in table [{}]",
                    id,
                    table.as_str()
                )));
            }
            rows.push(record);
        }
        StorageOp::Update { table, id, changes } => {
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.iter_mut().find(|r| record_str(r, "id") == Some(id.as_str())))
                .ok_or_else(|| {
                    WorkflowError::Storage(format!(
                        "No row [{}] in table [{}] to update",
                        id,
                        table.as_str()
                    ))
                })?;
            row.extend(changes);
        }
        StorageOp::Upsert { table, record } => {
            let id = row_id(&record, table)?;
            let rows = tables.entry(table).or_default();
            match rows.iter_mut().find(|r| record_str(r, "id") == Some(id.as_str())) {
                Some(row) => row.extend(record),
                None => rows.push(record),
            }
        }
        StorageOp::Delete { table, filter } => {
            if let Some(rows) = tables.get_mut(&table) {
                rows.retain(|r| !filter.iter().all(|(k, v)| r.get(k) == Some(v)));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl WorkflowStorage for MemoryStorage {
    async fn fetch_workflow_state(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
    ) -> Result<Option<WorkflowState>> {
        self.fetch_where(|r| {
            record_str(r, "key") == Some(key)
                && record_str(r, "resource_name") == Some(resource_name)
                && record_str(r, "resource_id") == Some(resource_id)
        })
        .await
    }

    async fn fetch_workflow_state_by_id(&self, key: &str, id: Uuid) -> Result<Option<WorkflowState>> {
        let id = id.to_string();
        self.fetch_where(|r| record_str(r, "key") == Some(key) && record_str(r, "id") == Some(id.as_str()))
            .await
    }

    async fn last_order(&self, workflow_id: Uuid) -> Result<u64> {
        let id = workflow_id.to_string();
        let tables = self.tables.read().await;
        let last = Table::ORDERED
            .iter()
            .filter_map(|table| tables.get(table))
            .flatten()
            .filter(|r| record_str(r, "workflow_id") == Some(id.as_str()))
            .filter_map(|r| r.get("order").and_then(|v| v.as_u64()))
            .max()
            .unwrap_or(0);
        Ok(last)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut next = tables.clone();
        for op in batch.ops {
            apply_op(&mut next, op)?;
        }
        *tables = next;
        Ok(())
    }
}
