//! RPC methods for workflow participants.
//!
//! Methods:
//! - `participants.add`: add a user under a declared role
//! - `participants.remove`: remove a user from one role or from all of them

use serde::{Deserialize, Serialize};

use super::{run, WorkflowRef, WorkflowSummary};
use crate::rpc::error::RpcError;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub user_id: String,
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantResult {
    pub status: &'static str,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub workflow: WorkflowSummary,
}

pub async fn add(state: &EngineState, params: AddParams) -> Result<ParticipantResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (user_id, role) = (params.user_id, params.role);
    let ((), workflow) = run(state, &handle, |tx| tx.add_participant(&user_id, &role)).await?;
    Ok(ParticipantResult {
        status: "participant_added",
        user_id,
        role: Some(role),
        workflow,
    })
}

pub async fn remove(state: &EngineState, params: RemoveParams) -> Result<ParticipantResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (user_id, role) = (params.user_id, params.role);
    let ((), workflow) = run(state, &handle, |tx| {
        tx.remove_participant(&user_id, role.as_deref())
    })
    .await?;
    Ok(ParticipantResult {
        status: "participant_removed",
        user_id,
        role,
        workflow,
    })
}
