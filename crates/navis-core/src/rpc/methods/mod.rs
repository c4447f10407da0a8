//! JSON-RPC method implementations, organized by domain.
//!
//! Each sub-module exposes typed param/result structs and async handlers that
//! take `EngineState` + params. Commands run in one runner transaction and
//! commit before they return.

pub mod definitions;
pub mod events;
pub mod participants;
pub mod steps;
pub mod triggers;
pub mod workflows;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::manager::RunnerHandle;
use crate::model::WorkflowState;
use crate::rpc::error::RpcError;
use crate::runner::WorkflowTransaction;
use crate::state::EngineState;
use crate::status::WorkflowStatus;

/// Addresses one workflow instance, by id or by the resource it is bound to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub workflow_key: String,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl WorkflowRef {
    pub async fn load(&self, state: &EngineState) -> Result<RunnerHandle, RpcError> {
        let manager = &state.manager;
        let handle = match (&self.workflow_id, &self.resource_name, &self.resource_id) {
            (Some(id), _, _) => manager.load_workflow_by_id(&self.workflow_key, *id).await?,
            (None, Some(name), Some(id)) => manager.load_workflow(&self.workflow_key, name, id).await?,
            _ => {
                return Err(RpcError::InvalidParams(
                    "workflowId or resourceName and resourceId are required".into(),
                ))
            }
        };
        Ok(handle)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub workflow_key: String,
    pub title: String,
    pub resource_name: String,
    pub resource_id: String,
    pub status: WorkflowStatus,
    pub label: Option<String>,
    pub progress: f64,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.id,
            workflow_key: state.key.clone(),
            title: state.title.clone(),
            resource_name: state.resource_name.clone(),
            resource_id: state.resource_id.clone(),
            status: state.status,
            label: state.label.clone(),
            progress: state.progress,
        }
    }
}

/// Run `f` as one transaction on `handle`, then commit it.
pub(crate) async fn run<T, F>(
    state: &EngineState,
    handle: &RunnerHandle,
    f: F,
) -> Result<(T, WorkflowSummary), RpcError>
where
    F: FnOnce(&mut WorkflowTransaction<'_>) -> Result<T> + Send,
    T: Send,
{
    let value = handle.lock().await.transaction(f)?;
    state.manager.commit_workflow(handle).await?;
    let summary = WorkflowSummary::from(handle.lock().await.state());
    Ok((value, summary))
}
