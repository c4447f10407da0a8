//! RPC methods for operator overrides on individual steps.
//!
//! Methods:
//! - `steps.add`: spawn a step instance
//! - `steps.transit`: move a step to another state through its transition table
//! - `steps.ignore`: close a step as SKIPPED
//! - `steps.cancel`: close a step as ABORTED
//! - `steps.recover`: bring an ERROR step back to ACTIVE

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{run, WorkflowRef, WorkflowSummary};
use crate::rpc::error::RpcError;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub step_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub step_id: Uuid,
    pub target: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParams {
    #[serde(flatten)]
    pub workflow: WorkflowRef,
    pub step_key: String,
    pub selector: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: &'static str,
    pub step_id: Uuid,
    pub workflow: WorkflowSummary,
}

pub async fn add(state: &EngineState, params: AddParams) -> Result<StepResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (step_key, selector, title) = (params.step_key, params.selector, params.title);
    let (step_id, workflow) = run(state, &handle, move |tx| tx.add_step(&step_key, selector, title)).await?;
    Ok(StepResult {
        status: "step_added",
        step_id,
        workflow,
    })
}

pub async fn transit(state: &EngineState, params: TransitParams) -> Result<StepResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (step_id, target, args) = (params.step_id, params.target, params.args);
    let ((), workflow) = run(state, &handle, move |tx| tx.transit_step(step_id, &target, args)).await?;
    Ok(StepResult {
        status: "step_transited",
        step_id,
        workflow,
    })
}

pub async fn ignore(state: &EngineState, params: StepParams) -> Result<StepResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (step_id, reason) = (params.step_id, params.reason);
    let ((), workflow) = run(state, &handle, move |tx| tx.ignore_step(step_id, reason)).await?;
    Ok(StepResult {
        status: "step_ignored",
        step_id,
        workflow,
    })
}

pub async fn cancel(state: &EngineState, params: StepParams) -> Result<StepResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let (step_id, reason) = (params.step_id, params.reason);
    let ((), workflow) = run(state, &handle, move |tx| tx.cancel_step(step_id, reason)).await?;
    Ok(StepResult {
        status: "step_cancelled",
        step_id,
        workflow,
    })
}

pub async fn recover(state: &EngineState, params: StepParams) -> Result<StepResult, RpcError> {
    let handle = params.workflow.load(state).await?;
    let step_id = params.step_id;
    let ((), workflow) = run(state, &handle, move |tx| tx.recover_step(step_id)).await?;
    Ok(StepResult {
        status: "step_recovered",
        step_id,
        workflow,
    })
}
