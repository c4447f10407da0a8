//! Transport-agnostic JSON-RPC 2.0 layer for the workflow engine.
//!
//! Every engine command (create, start, pause, participants, events,
//! triggers, step overrides, definition export) is exposed as one method.
//! The router has no HTTP dependency, so hosts can serve it over any
//! transport. The bundled CLI feeds it from command-line arguments.
//!
//! # Example
//!
//! ```ignore
//! use navis_core::rpc::RpcRouter;
//!
//! let router = RpcRouter::new(engine_state);
//! let response = router.handle_request(r#"{
//!     "jsonrpc": "2.0",
//!     "id": 1,
//!     "method": "workflows.create",
//!     "params": { "workflowKey": "loan-application", "resourceName": "application", "resourceId": "A-1" }
//! }"#).await;
//! ```

pub mod error;
pub mod methods;
pub mod router;
pub mod types;

pub use error::RpcError;
pub use router::RpcRouter;
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
