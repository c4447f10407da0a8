//! Mutation records produced by a runner and consumed by the manager.
//!
//! Every state change of a workflow instance is described by exactly one
//! [`Mutation`] wrapped in a [`MutationEnvelope`]. Envelopes are append-only:
//! the runner buffers them in order and the manager dispatches each kind to
//! a fixed persistence handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{DataMap, Participant, WorkflowStage, WorkflowState, WorkflowStep};
use crate::status::{StepStatus, WorkflowStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mutation {
    /// New workflow row. Embedded collections are always empty here.
    InitializeWorkflow { workflow: WorkflowState },
    UpdateWorkflow(WorkflowUpdate),
    AddStep { step: WorkflowStep },
    UpdateStep(StepUpdate),
    /// Full snapshot of the workflow memory, or of the envelope's step memory.
    SetMemory { memory: DataMap },
    AddParticipant { participant: Participant },
    DelParticipant { user_id: String, role: Option<String> },
    AddStage { stage: WorkflowStage },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::InitializeWorkflow { .. } => "initialize-workflow",
            Mutation::UpdateWorkflow(_) => "update-workflow",
            Mutation::AddStep { .. } => "add-step",
            Mutation::UpdateStep(_) => "update-step",
            Mutation::SetMemory { .. } => "set-memory",
            Mutation::AddParticipant { .. } => "add-participant",
            Mutation::DelParticipant { .. } => "del-participant",
            Mutation::AddStage { .. } => "add-stage",
        }
    }
}

/// Snapshot of the mutable columns of a workflow row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowUpdate {
    pub title: String,
    pub status: WorkflowStatus,
    pub paused: Option<WorkflowStatus>,
    pub progress: f64,
    pub label: Option<String>,
    pub ts_start: Option<DateTime<Utc>>,
    pub ts_finish: Option<DateTime<Utc>>,
}

impl From<&WorkflowState> for WorkflowUpdate {
    fn from(state: &WorkflowState) -> Self {
        Self {
            title: state.title.clone(),
            status: state.status,
            paused: state.paused,
            progress: state.progress,
            label: state.label.clone(),
            ts_start: state.ts_start,
            ts_finish: state.ts_finish,
        }
    }
}

/// Snapshot of the mutable columns of a step row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepUpdate {
    pub title: String,
    pub label: String,
    pub status: StepStatus,
    pub message: Option<String>,
    pub ts_finish: Option<DateTime<Utc>>,
}

impl From<&WorkflowStep> for StepUpdate {
    fn from(step: &WorkflowStep) -> Self {
        Self {
            title: step.title.clone(),
            label: step.label.clone(),
            status: step.status,
            message: step.message.clone(),
            ts_finish: step.ts_finish,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationEnvelope {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub transaction_id: Uuid,
    /// Runner action that produced the mutation (`start`, `trigger`, ...).
    pub action: String,
    pub step_id: Option<Uuid>,
    pub order: u64,
    pub created_at: DateTime<Utc>,
    pub mutation: Mutation,
}

impl MutationEnvelope {
    pub fn kind(&self) -> &'static str {
        self.mutation.kind()
    }
}
