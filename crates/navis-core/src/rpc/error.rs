//! RPC error type that bridges `WorkflowError` to JSON-RPC errors.

use super::types;
use crate::error::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The command is valid but not allowed in the workflow's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::NotFound(_) => types::NOT_FOUND,
            RpcError::BadRequest(_) => types::BAD_REQUEST,
            RpcError::Conflict(_) => types::CONFLICT,
            RpcError::Internal(_) => types::INTERNAL_ERROR,
            RpcError::InvalidParams(_) => types::INVALID_PARAMS,
            RpcError::MethodNotFound(_) => types::METHOD_NOT_FOUND,
        }
    }

    /// Stable snake_case name of the variant, sent as `error.data.reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            RpcError::NotFound(_) => "not_found",
            RpcError::BadRequest(_) => "bad_request",
            RpcError::Conflict(_) => "conflict",
            RpcError::Internal(_) => "internal",
            RpcError::InvalidParams(_) => "invalid_params",
            RpcError::MethodNotFound(_) => "method_not_found",
        }
    }

    pub fn to_response(&self, id: types::RequestId) -> types::JsonRpcResponse {
        let error = types::JsonRpcError::new(self.code(), self.to_string())
            .with_data(serde_json::json!({ "reason": self.reason() }));
        types::JsonRpcResponse::failure(id, error)
    }
}

impl From<WorkflowError> for RpcError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound(msg) => RpcError::NotFound(msg),
            WorkflowError::Execution(msg) => RpcError::Conflict(msg),
            WorkflowError::Configuration(msg) => RpcError::BadRequest(msg),
            WorkflowError::InvalidData(msg) => RpcError::Internal(msg),
            WorkflowError::Storage(msg) => RpcError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_errors_map_to_codes() {
        let err: RpcError = WorkflowError::NotFound("Workflow [x]".into()).into();
        assert_eq!(err.code(), types::NOT_FOUND);

        let err: RpcError = WorkflowError::Execution("Cannot start".into()).into();
        assert_eq!(err.code(), types::CONFLICT);
        assert_eq!(err.to_string(), "Conflict: Cannot start");

        let response = RpcError::Internal("disk full".into()).to_response(Some(7.into()));
        let error = response.error.unwrap();
        assert_eq!(error.code, types::INTERNAL_ERROR);
        assert_eq!(error.data, Some(serde_json::json!({ "reason": "internal" })));
        assert_eq!(response.id, Some(7.into()));
    }
}
