//! `navis event`: Route an external event and commit every affected workflow.

use navis_core::rpc::methods::WorkflowSummary;
use navis_core::{EngineState, EventData};

use super::print_json;

pub async fn process(
    state: &EngineState,
    name: &str,
    resource_name: &str,
    resource_id: &str,
    selector: Option<&str>,
    data_str: &str,
) -> Result<Vec<WorkflowSummary>, String> {
    let data: serde_json::Value =
        serde_json::from_str(data_str).map_err(|e| format!("Invalid JSON data: {}", e))?;
    let serde_json::Value::Object(data) = data else {
        return Err("Event data must be a JSON object".to_string());
    };

    let mut event = EventData::new(resource_name, resource_id);
    event.step_selector = selector.map(String::from);
    event.data = data;

    let affected = state
        .manager
        .process_event(name, &event)
        .await
        .map_err(|e| e.to_string())?;

    let mut summaries = Vec::with_capacity(affected.len());
    for handle in &affected {
        state
            .manager
            .commit_workflow(handle)
            .await
            .map_err(|e| e.to_string())?;
        summaries.push(WorkflowSummary::from(handle.lock().await.state()));
    }
    Ok(summaries)
}

pub async fn send(
    state: &EngineState,
    name: &str,
    resource_name: &str,
    resource_id: &str,
    selector: Option<&str>,
    data_str: &str,
) -> Result<(), String> {
    let summaries = process(state, name, resource_name, resource_id, selector, data_str).await?;
    if summaries.is_empty() {
        tracing::info!(event = name, "No workflow handles event");
    }
    print_json(&serde_json::json!({ "event": name, "workflows": summaries }));
    Ok(())
}
