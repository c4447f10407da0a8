//! `navis workflow`: Create and inspect workflow instances.

use navis_core::rpc::{JsonRpcRequest, RpcRouter};
use navis_core::EngineState;
use serde_json::{json, Value};

use super::print_json;

async fn call(state: &EngineState, method: &str, params: Value) -> Result<Value, String> {
    let response = RpcRouter::new(state.clone())
        .dispatch(JsonRpcRequest::new(1, method, params))
        .await;
    match (response.result, response.error) {
        (_, Some(error)) => Err(error.message),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    }
}

pub async fn create(
    state: &EngineState,
    key: &str,
    resource_name: &str,
    resource_id: Option<&str>,
    params_str: &str,
    title: Option<&str>,
    start: bool,
) -> Result<(), String> {
    let params: Value =
        serde_json::from_str(params_str).map_err(|e| format!("Invalid JSON params: {}", e))?;
    // Ad-hoc instances get a fresh resource id.
    let resource_id = resource_id
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut result = call(
        state,
        "workflows.create",
        json!({
            "workflowKey": key,
            "resourceName": resource_name,
            "resourceId": resource_id,
            "params": params,
            "title": title,
        }),
    )
    .await?;

    if start {
        let workflow_id = result["workflow"]["workflowId"].clone();
        result = call(
            state,
            "workflows.start",
            json!({ "workflowKey": key, "workflowId": workflow_id }),
        )
        .await?;
    }
    print_json(&result);
    Ok(())
}

pub async fn get(state: &EngineState, key: &str, id: &str) -> Result<(), String> {
    let result = call(
        state,
        "workflows.get",
        json!({ "workflowKey": key, "workflowId": id }),
    )
    .await?;
    print_json(&result);
    Ok(())
}
