//! RPC methods for workflow lifecycle.
//!
//! Methods:
//! - `workflows.create`: create and persist a new instance
//! - `workflows.start`: BLANK → ACTIVE
//! - `workflows.pause`: suspend event processing
//! - `workflows.resume`: return to the status held before pausing
//! - `workflows.cancel`: terminate as CANCELLED
//! - `workflows.abort`: terminate as FAILED
//! - `workflows.get`: full state, steps included

use serde::{Deserialize, Serialize};

use super::{run, WorkflowRef, WorkflowSummary};
use crate::model::{DataMap, WorkflowState};
use crate::rpc::error::RpcError;
use crate::state::EngineState;

// ---------------------------------------------------------------------------
// workflows.create
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub workflow_key: String,
    pub resource_name: String,
    pub resource_id: String,
    #[serde(default)]
    pub params: DataMap,
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResult {
    pub workflow: WorkflowSummary,
}

pub async fn create(state: &EngineState, params: CreateParams) -> Result<CreateResult, RpcError> {
    let handle = state
        .manager
        .create_workflow(
            &params.workflow_key,
            &params.resource_name,
            &params.resource_id,
            params.params,
            params.title,
        )
        .await?;
    state.manager.commit_workflow(&handle).await?;
    let workflow = WorkflowSummary::from(handle.lock().await.state());
    Ok(CreateResult { workflow })
}

// ---------------------------------------------------------------------------
// workflows.start / pause / resume / cancel / abort
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub params: DataMap,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub status: &'static str,
    pub workflow: WorkflowSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn start(state: &EngineState, params: StartParams) -> Result<CommandResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let start_params = params.params;
    let ((), workflow) = run(state, &handle, move |tx| tx.start(start_params)).await?;
    Ok(CommandResult {
        status: "started",
        workflow,
        reason: None,
    })
}

pub async fn pause(state: &EngineState, params: CommandParams) -> Result<CommandResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let ((), workflow) = run(state, &handle, |tx| tx.pause()).await?;
    Ok(CommandResult {
        status: "paused",
        workflow,
        reason: params.reason,
    })
}

pub async fn resume(state: &EngineState, params: CommandParams) -> Result<CommandResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let ((), workflow) = run(state, &handle, |tx| tx.resume()).await?;
    Ok(CommandResult {
        status: "resumed",
        workflow,
        reason: params.reason,
    })
}

pub async fn cancel(state: &EngineState, params: CommandParams) -> Result<CommandResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let ((), workflow) = run(state, &handle, |tx| tx.cancel()).await?;
    Ok(CommandResult {
        status: "cancelled",
        workflow,
        reason: params.reason,
    })
}

pub async fn abort(state: &EngineState, params: CommandParams) -> Result<CommandResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let ((), workflow) = run(state, &handle, |tx| tx.abort()).await?;
    Ok(CommandResult {
        status: "aborted",
        workflow,
        reason: params.reason,
    })
}

// ---------------------------------------------------------------------------
// workflows.get
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GetParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
}

#[derive(Debug, Serialize)]
pub struct GetResult {
    pub workflow: WorkflowState,
}

pub async fn get(state: &EngineState, params: GetParams) -> Result<GetResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let workflow = handle.lock().await.state().clone();
    Ok(GetResult { workflow })
}
