//! Runtime records of a workflow instance.
//!
//! These are the shapes persisted by the storage collaborator and embedded
//! in [`WorkflowState`] for rehydration. Field names double as storage
//! column names, so they stay snake_case on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::status::{StageStatus, StepStatus, WorkflowStatus};

/// Free-form data attached to a workflow or step.
pub type DataMap = Map<String, Value>;

/// Full runtime state of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub id: Uuid,
    pub key: String,
    pub revision: u32,
    pub title: String,
    pub namespace: Option<String>,
    pub resource_name: String,
    pub resource_id: String,
    pub status: WorkflowStatus,
    /// Status to return to when a paused workflow resumes.
    pub paused: Option<WorkflowStatus>,
    pub progress: f64,
    /// Coarse, workflow-level label set by handlers.
    pub label: Option<String>,
    pub params: DataMap,
    pub created_at: DateTime<Utc>,
    pub ts_start: Option<DateTime<Utc>>,
    pub ts_finish: Option<DateTime<Utc>>,

    #[serde(default)]
    pub memory: DataMap,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub stages: Vec<WorkflowStage>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl WorkflowState {
    /// Keys of the embedded collections; they live in their own tables.
    pub const EMBEDDED: [&'static str; 4] = ["memory", "steps", "stages", "participants"];

    pub fn step(&self, id: &Uuid) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn steps_by_key<'a, 'k>(&'a self, step_key: &'k str) -> impl Iterator<Item = &'a WorkflowStep> + 'k
    where
        'a: 'k,
    {
        self.steps.iter().filter(move |s| s.step_key == step_key)
    }

    pub fn has_participant(&self, user_id: &str, role: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == user_id && p.role == role)
    }
}

/// One instantiated step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_key: String,
    pub title: String,
    pub stage_key: String,
    /// Instance number among steps sharing `step_key` (always 0 unless multi).
    pub index: u32,
    /// External correlation token used by event routing.
    pub selector: String,
    /// Current state-machine label.
    pub label: String,
    pub status: StepStatus,
    /// Step whose handler spawned this one.
    pub src_step: Option<Uuid>,
    pub message: Option<String>,
    pub ts_start: DateTime<Utc>,
    pub ts_finish: Option<DateTime<Utc>>,

    #[serde(default)]
    pub memory: DataMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStage {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub key: String,
    pub title: String,
    pub order: u32,
    pub stage_type: String,
    pub desc: Option<String>,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: String,
    pub role: String,
}

/// Audit record: one per runner action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowActivity {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub transaction_id: Uuid,
    pub name: String,
    pub args: Value,
    pub step_id: Option<Uuid>,
    pub order: u64,
    pub created_at: DateTime<Utc>,
}

/// Audit record: one per narration line produced by a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMessage {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub transaction_id: Uuid,
    pub step_id: Option<Uuid>,
    pub source: String,
    pub content: String,
    pub order: u64,
    pub created_at: DateTime<Utc>,
}
