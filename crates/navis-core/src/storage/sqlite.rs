use async_trait::async_trait;
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::Connection;
use serde_json::Value;
use uuid::Uuid;

use super::{assemble_state, record_str, Record, StateRows, StorageOp, Table, WorkflowStorage, WriteBatch};
use crate::db::Database;
use crate::error::{Result, WorkflowError};
use crate::model::WorkflowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Text,
    Integer,
    Real,
    /// Serialized JSON stored as TEXT.
    Json,
}

fn sql_table(table: Table) -> &'static str {
    match table {
        Table::Workflow => "workflow",
        Table::WorkflowStep => "workflow_step",
        Table::WorkflowMemory => "workflow_memory",
        Table::WorkflowParticipant => "workflow_participant",
        Table::WorkflowStage => "workflow_stage",
        Table::WorkflowMutation => "workflow_mutation",
        Table::WorkflowActivity => "workflow_activity",
        Table::WorkflowMessage => "workflow_message",
    }
}

/// Column whitelist per table. SQL is only ever built from these names.
fn columns(table: Table) -> &'static [(&'static str, Column)] {
    use Column::*;
    match table {
        Table::Workflow => &[
            ("id", Text),
            ("key", Text),
            ("revision", Integer),
            ("title", Text),
            ("namespace", Text),
            ("resource_name", Text),
            ("resource_id", Text),
            ("status", Text),
            ("paused", Text),
            ("progress", Real),
            ("label", Text),
            ("params", Json),
            ("created_at", Text),
            ("ts_start", Text),
            ("ts_finish", Text),
        ],
        Table::WorkflowStep => &[
            ("id", Text),
            ("workflow_id", Text),
            ("step_key", Text),
            ("title", Text),
            ("stage_key", Text),
            ("index", Integer),
            ("selector", Text),
            ("label", Text),
            ("status", Text),
            ("src_step", Text),
            ("message", Text),
            ("ts_start", Text),
            ("ts_finish", Text),
        ],
        Table::WorkflowStage => &[
            ("id", Text),
            ("workflow_id", Text),
            ("key", Text),
            ("title", Text),
            ("order", Integer),
            ("stage_type", Text),
            ("desc", Text),
            ("status", Text),
        ],
        Table::WorkflowMemory => &[
            ("id", Text),
            ("workflow_id", Text),
            ("step_id", Text),
            ("memory", Json),
        ],
        Table::WorkflowParticipant => &[
            ("id", Text),
            ("workflow_id", Text),
            ("user_id", Text),
            ("role", Text),
        ],
        Table::WorkflowMutation => &[
            ("id", Text),
            ("workflow_id", Text),
            ("transaction_id", Text),
            ("kind", Text),
            ("action", Text),
            ("step_id", Text),
            ("order", Integer),
            ("payload", Json),
            ("created_at", Text),
        ],
        Table::WorkflowActivity => &[
            ("id", Text),
            ("workflow_id", Text),
            ("transaction_id", Text),
            ("name", Text),
            ("args", Json),
            ("step_id", Text),
            ("order", Integer),
            ("created_at", Text),
        ],
        Table::WorkflowMessage => &[
            ("id", Text),
            ("workflow_id", Text),
            ("transaction_id", Text),
            ("step_id", Text),
            ("source", Text),
            ("content", Text),
            ("order", Integer),
            ("created_at", Text),
        ],
    }
}

fn column(table: Table, name: &str) -> Result<(&'static str, Column)> {
    columns(table)
        .iter()
        .find(|(col, _)| *col == name)
        .copied()
        .ok_or_else(|| {
            WorkflowError::InvalidData(format!(
                "Unknown column [{}] for table [{}]",
                name,
                table.as_str()
            ))
        })
}

fn to_sql(kind: Column, table: Table, name: &str, value: &Value) -> Result<SqlValue> {
    let bad = || {
        WorkflowError::InvalidData(format!(
            "Column [{}.{}] cannot store {}",
            table.as_str(),
            name,
            value
        ))
    };
    Ok(match (kind, value) {
        (Column::Json, v) => SqlValue::Text(v.to_string()),
        (_, Value::Null) => SqlValue::Null,
        (Column::Integer, v) => SqlValue::Integer(v.as_i64().ok_or_else(bad)?),
        (Column::Real, v) => SqlValue::Real(v.as_f64().ok_or_else(bad)?),
        (Column::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (Column::Text, v) => SqlValue::Text(v.to_string()),
    })
}

fn from_sql(kind: Column, value: SqlValue) -> Result<Value> {
    Ok(match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) if kind == Column::Json => serde_json::from_str(&s)?,
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(_) => {
            return Err(WorkflowError::InvalidData("Unexpected BLOB column".into()))
        }
    })
}

fn bind(table: Table, record: &Record) -> Result<(Vec<&'static str>, Vec<SqlValue>)> {
    let mut names = Vec::with_capacity(record.len());
    let mut values = Vec::with_capacity(record.len());
    for (name, value) in record {
        let (col, kind) = column(table, name)?;
        values.push(to_sql(kind, table, col, value)?);
        names.push(col);
    }
    Ok((names, values))
}

fn quoted(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn execute_op(conn: &Connection, op: StorageOp) -> Result<()> {
    match op {
        StorageOp::Insert { table, record } => {
            let (names, values) = bind(table, &record)?;
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                sql_table(table),
                quoted(&names),
                placeholders(names.len())
            );
            conn.execute(&sql, rusqlite::params_from_iter(values))?;
        }
        StorageOp::Upsert { table, record } => {
            let (names, values) = bind(table, &record)?;
            let updates: Vec<String> = names
                .iter()
                .filter(|n| **n != "id")
                .map(|n| format!("\"{0}\" = excluded.\"{0}\"", n))
                .collect();
            let conflict = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) {}",
                sql_table(table),
                quoted(&names),
                placeholders(names.len()),
                conflict
            );
            conn.execute(&sql, rusqlite::params_from_iter(values))?;
        }
        StorageOp::Update { table, id, changes } => {
            let (names, mut values) = bind(table, &changes)?;
            let sql = if names.is_empty() {
                format!("UPDATE {} SET id = id WHERE id = ?1", sql_table(table))
            } else {
                let set: Vec<String> = names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| format!("\"{}\" = ?{}", n, i + 1))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE id = ?{}",
                    sql_table(table),
                    set.join(", "),
                    names.len() + 1
                )
            };
            values.push(SqlValue::Text(id.clone()));
            let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
            if changed == 0 {
                return Err(WorkflowError::Storage(format!(
                    "No row [{}] in table [{}] to update",
                    id,
                    table.as_str()
                )));
            }
        }
        StorageOp::Delete { table, filter } => {
            if filter.is_empty() {
                return Err(WorkflowError::InvalidData(format!(
                    "Refusing to delete from [{}] without a filter",
                    table.as_str()
                )));
            }
            let (names, values) = bind(table, &filter)?;
            let clause: Vec<String> = names
                .iter()
                .enumerate()
                .map(|(i, n)| format!("\"{}\" = ?{}", n, i + 1))
                .collect();
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                sql_table(table),
                clause.join(" AND ")
            );
            conn.execute(&sql, rusqlite::params_from_iter(values))?;
        }
    }
    Ok(())
}

fn read_rows(
    conn: &Connection,
    table: Table,
    clause: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Record>> {
    let cols = columns(table);
    let names: Vec<&str> = cols.iter().map(|(n, _)| *n).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        quoted(&names),
        sql_table(table),
        clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (i, (name, kind)) in cols.iter().enumerate() {
            let value: SqlValue = row.get(i)?;
            record.insert(name.to_string(), from_sql(*kind, value)?);
        }
        out.push(record);
    }
    Ok(out)
}

fn load_state(conn: &Connection, workflow: Record) -> Result<WorkflowState> {
    let id = record_str(&workflow, "id").unwrap_or_default().to_string();
    let children = |table: Table| {
        read_rows(conn, table, "workflow_id = ?1 ORDER BY rowid", &[&id])
    };
    let rows = StateRows {
        steps: children(Table::WorkflowStep)?,
        stages: children(Table::WorkflowStage)?,
        participants: children(Table::WorkflowParticipant)?,
        memory: children(Table::WorkflowMemory)?,
        workflow,
    };
    assemble_state(rows)
}

/// SQLite-backed storage. Each batch runs in one SQL transaction.
#[derive(Clone)]
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(Database::open(db_path)?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn count(&self, table: Table) -> Result<usize> {
        self.db
            .with_conn_async(move |conn| {
                let sql = format!("SELECT COUNT(*) FROM {}", sql_table(table));
                let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
    }
}

#[async_trait]
impl WorkflowStorage for SqliteStorage {
    async fn fetch_workflow_state(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
    ) -> Result<Option<WorkflowState>> {
        let (key, resource_name, resource_id) =
            (key.to_string(), resource_name.to_string(), resource_id.to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut rows = read_rows(
                    conn,
                    Table::Workflow,
                    "\"key\" = ?1 AND resource_name = ?2 AND resource_id = ?3 ORDER BY rowid DESC LIMIT 1",
                    &[&key, &resource_name, &resource_id],
                )?;
                match rows.pop() {
                    Some(workflow) => load_state(conn, workflow).map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn fetch_workflow_state_by_id(&self, key: &str, id: Uuid) -> Result<Option<WorkflowState>> {
        let (key, id) = (key.to_string(), id.to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut rows = read_rows(
                    conn,
                    Table::Workflow,
                    "\"key\" = ?1 AND id = ?2",
                    &[&key, &id],
                )?;
                match rows.pop() {
                    Some(workflow) => load_state(conn, workflow).map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn last_order(&self, workflow_id: Uuid) -> Result<u64> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let selects: Vec<String> = Table::ORDERED
                    .iter()
                    .map(|t| format!("SELECT MAX(\"order\") AS o FROM {} WHERE workflow_id = ?1", sql_table(*t)))
                    .collect();
                let sql = format!("SELECT COALESCE(MAX(o), 0) FROM ({})", selects.join(" UNION ALL "));
                let last: i64 = conn.query_row(&sql, [&id], |row| row.get(0))?;
                Ok(last.max(0) as u64)
            })
            .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let operations = batch.len();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                for op in batch.ops {
                    execute_op(&tx, op)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::debug!(operations, "Applied write batch");
        Ok(())
    }
}
