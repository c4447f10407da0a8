//! JSON-RPC 2.0 dispatcher for the engine's command surface.
//!
//! Method names are `<group>.<action>`. The router resolves the group first
//! and lets each group parse its own params, so a new action only touches
//! [`METHODS`] and its group's match.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::state::EngineState;

use super::error::RpcError;
use super::methods::{definitions, events, participants, steps, triggers, workflows};
use super::types::{JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR};

/// Every supported method, in display order.
pub const METHODS: &[&str] = &[
    "workflows.create",
    "workflows.start",
    "workflows.pause",
    "workflows.resume",
    "workflows.cancel",
    "workflows.abort",
    "workflows.get",
    "participants.add",
    "participants.remove",
    "events.inject",
    "triggers.send",
    "steps.add",
    "steps.transit",
    "steps.ignore",
    "steps.cancel",
    "steps.recover",
    "definitions.list",
];

/// Transport-agnostic JSON-RPC router over an [`EngineState`].
///
/// ```ignore
/// let router = RpcRouter::new(engine_state);
/// let raw = router.handle_request(r#"{"jsonrpc":"2.0","id":1,"method":"definitions.list"}"#).await;
/// ```
#[derive(Clone)]
pub struct RpcRouter {
    state: EngineState,
}

impl RpcRouter {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Handle a raw request or batch and serialize the reply.
    pub async fn handle_request(&self, raw: &str) -> String {
        let reply = match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => response_value(JsonRpcResponse::error(
                None,
                PARSE_ERROR,
                format!("Parse error: {}", e),
            )),
        };
        reply.to_string()
    }

    /// Handle a parsed request object, or an array of them.
    pub async fn handle_value(&self, value: Value) -> Value {
        match value {
            Value::Array(batch) if batch.is_empty() => response_value(JsonRpcResponse::error(
                None,
                INVALID_REQUEST,
                "Empty batch",
            )),
            Value::Array(batch) => {
                let mut replies = Vec::with_capacity(batch.len());
                for item in batch {
                    replies.push(response_value(self.handle_one(item).await));
                }
                Value::Array(replies)
            }
            single => response_value(self.handle_one(single).await),
        }
    }

    async fn handle_one(&self, value: Value) -> JsonRpcResponse {
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => JsonRpcResponse::error(None, INVALID_REQUEST, format!("Invalid request: {}", e)),
        }
    }

    pub async fn dispatch(&self, mut request: JsonRpcRequest) -> JsonRpcResponse {
        if !request.has_valid_version() {
            return JsonRpcResponse::error(
                request.id,
                INVALID_REQUEST,
                "Invalid JSON-RPC version, expected \"2.0\"",
            );
        }
        let params = request.params_or_default();
        match self.route(&request.method, params).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(err) => {
                tracing::debug!(method = %request.method, error = %err, "RPC call failed");
                err.to_response(request.id)
            }
        }
    }

    async fn route(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let not_found = || RpcError::MethodNotFound(method.to_string());
        let (group, action) = method.split_once('.').ok_or_else(not_found)?;
        let state = &self.state;
        match group {
            "workflows" => self.workflows(action, params).await,
            "participants" => match action {
                "add" => to_json(participants::add(state, parse(params)?).await?),
                "remove" => to_json(participants::remove(state, parse(params)?).await?),
                _ => Err(not_found()),
            },
            "steps" => match action {
                "add" => to_json(steps::add(state, parse(params)?).await?),
                "transit" => to_json(steps::transit(state, parse(params)?).await?),
                "ignore" => to_json(steps::ignore(state, parse(params)?).await?),
                "cancel" => to_json(steps::cancel(state, parse(params)?).await?),
                "recover" => to_json(steps::recover(state, parse(params)?).await?),
                _ => Err(not_found()),
            },
            "events" if action == "inject" => to_json(events::inject(state, parse(params)?).await?),
            "triggers" if action == "send" => to_json(triggers::send(state, parse(params)?).await?),
            "definitions" if action == "list" => to_json(definitions::list(state).await?),
            _ => Err(not_found()),
        }
    }

    async fn workflows(&self, action: &str, params: Value) -> Result<Value, RpcError> {
        let state = &self.state;
        match action {
            "create" => to_json(workflows::create(state, parse(params)?).await?),
            "start" => to_json(workflows::start(state, parse(params)?).await?),
            "pause" => to_json(workflows::pause(state, parse(params)?).await?),
            "resume" => to_json(workflows::resume(state, parse(params)?).await?),
            "cancel" => to_json(workflows::cancel(state, parse(params)?).await?),
            "abort" => to_json(workflows::abort(state, parse(params)?).await?),
            "get" => to_json(workflows::get(state, parse(params)?).await?),
            other => Err(RpcError::MethodNotFound(format!("workflows.{}", other))),
        }
    }

    /// All supported method names.
    pub fn method_list(&self) -> Vec<&'static str> {
        METHODS.to_vec()
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(format!("Invalid params: {}", e)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(format!("Failed to serialize result: {}", e)))
}

fn response_value(response: JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": INTERNAL_ERROR, "message": format!("Failed to serialize response: {}", e) }
        })
    })
}
