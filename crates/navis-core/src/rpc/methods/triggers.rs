//! RPC methods for delayed triggers.
//!
//! Methods:
//! - `triggers.send`: acknowledge a trigger and compute its due time
//!
//! The engine keeps no timers. The returned `dueAt` is for an external
//! scheduler, which later delivers the trigger as an event.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::WorkflowRef;
use crate::rpc::error::RpcError;
use crate::state::EngineState;
use crate::status::WorkflowStatus;

/// Statuses that accept triggers.
pub const TRIGGERABLE: &[WorkflowStatus] = &[WorkflowStatus::Blank, WorkflowStatus::Active];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_data: Value,
    pub target_id: Option<String>,
    #[serde(default)]
    pub delay_seconds: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub status: &'static str,
    pub trigger_type: String,
    pub workflow_id: Uuid,
    pub target_id: Option<String>,
    pub trigger_data: Value,
    pub delay_seconds: u32,
    pub due_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

pub async fn send(state: &EngineState, params: SendParams) -> Result<SendResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (workflow_id, status) = {
        let runner = handle.lock().await;
        (runner.id(), runner.status())
    };
    if !TRIGGERABLE.contains(&status) {
        return Err(RpcError::Conflict(format!(
            "Cannot send trigger to workflow in status {}",
            status
        )));
    }

    let timestamp = Utc::now();
    tracing::info!(
        workflow_id = %workflow_id,
        trigger = %params.trigger_type,
        delay = params.delay_seconds,
        "Trigger accepted"
    );
    Ok(SendResult {
        status: "trigger_sent",
        trigger_type: params.trigger_type,
        workflow_id,
        target_id: params.target_id,
        trigger_data: params.trigger_data,
        delay_seconds: params.delay_seconds,
        due_at: timestamp + Duration::seconds(i64::from(params.delay_seconds)),
        timestamp,
    })
}
