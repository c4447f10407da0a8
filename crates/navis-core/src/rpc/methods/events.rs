//! RPC methods for external events.
//!
//! Methods:
//! - `events.inject`: route an event and require that it reached the
//!   addressed workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{WorkflowRef, WorkflowSummary};
use crate::router::EventData;
use crate::rpc::error::RpcError;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub event_name: String,
    #[serde(default)]
    pub event_data: EventData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectResult {
    pub status: &'static str,
    pub event_name: String,
    pub workflow: WorkflowSummary,
    /// Every workflow the event reached, the addressed one included.
    pub affected: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

pub async fn inject(state: &EngineState, params: InjectParams) -> Result<InjectResult, RpcError> {
    let target = params.workflow.load(state).await?;
    let target_id = target.lock().await.id();

    let affected = state
        .manager
        .process_event(&params.event_name, &params.event_data)
        .await?;

    let mut ids = Vec::with_capacity(affected.len());
    for handle in &affected {
        ids.push(handle.lock().await.id());
        state.manager.commit_workflow(handle).await?;
    }
    if !ids.contains(&target_id) {
        return Err(RpcError::BadRequest(format!(
            "Event [{}] not found in workflow [{}] => {:?}",
            params.event_name, target_id, ids
        )));
    }

    let workflow = WorkflowSummary::from(target.lock().await.state());
    Ok(InjectResult {
        status: "ok",
        event_name: params.event_name,
        workflow,
        affected: ids,
        timestamp: Utc::now(),
    })
}
