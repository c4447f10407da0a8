//! Navis Core: workflow orchestration engine.
//!
//! Workflow definitions are declared with builders and registered once at
//! startup. Each step of a workflow runs its own label state machine. External
//! events are routed to the workflow instances (and steps) bound to them, and
//! every state change is buffered as a mutation record until the manager
//! persists it atomically. The crate has no transport dependency, so it can
//! be embedded in:
//!
//! - CLI tools (via `navis-cli`)
//! - services exposing the JSON-RPC [`rpc::RpcRouter`]
//! - tests, with [`storage::MemoryStorage`]

pub mod config;
pub mod db;
pub mod definition;
pub mod error;
pub mod manager;
pub mod model;
pub mod mutation;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod runner;
pub mod state;
pub mod state_machine;
pub mod status;
pub mod storage;
pub mod util;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use definition::{
    Lifecycle, Role, SourceStates, Stage, StepBuilder, WorkflowBuilder, WorkflowDefinition, ALL_STATES,
};
pub use error::{Result, WorkflowError};
pub use manager::{RunnerHandle, WorkflowManager};
pub use registry::WorkflowRegistry;
pub use router::{EventData, Subscription};
pub use runner::{WorkflowContext, WorkflowRunner, WorkflowTransaction};
pub use state::{EngineState, EngineStateInner};
pub use status::{StepStatus, WorkflowStatus};
pub use storage::{MemoryStorage, SqliteStorage, WorkflowStorage};
