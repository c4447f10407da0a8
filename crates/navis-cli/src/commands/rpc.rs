//! `navis rpc`: Raw JSON-RPC invocation.

use navis_core::rpc::{JsonRpcRequest, RpcRouter};
use navis_core::EngineState;

use super::print_json;

pub async fn call(state: &EngineState, method: &str, params_str: &str) -> Result<(), String> {
    let params: serde_json::Value =
        serde_json::from_str(params_str).map_err(|e| format!("Invalid JSON params: {}", e))?;

    let response = RpcRouter::new(state.clone())
        .dispatch(JsonRpcRequest::new(1, method, params))
        .await;
    let failed = response.is_error();
    let value = serde_json::to_value(&response).map_err(|e| format!("Failed to render response: {}", e))?;
    print_json(&value);
    if failed {
        return Err(format!("RPC method '{}' failed", method));
    }
    Ok(())
}

/// Print every supported method name, one per line.
pub fn methods(state: &EngineState) {
    for method in RpcRouter::new(state.clone()).method_list() {
        println!("{}", method);
    }
}
