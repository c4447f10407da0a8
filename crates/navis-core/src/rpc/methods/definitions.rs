//! RPC methods for registered definitions.
//!
//! Methods:
//! - `definitions.list`: metadata of every registered workflow

use serde::Serialize;

use crate::definition::DefinitionMetadata;
use crate::rpc::error::RpcError;
use crate::state::EngineState;

#[derive(Debug, Serialize)]
pub struct ListResult {
    pub definitions: Vec<DefinitionMetadata>,
}

pub async fn list(state: &EngineState) -> Result<ListResult, RpcError> {
    Ok(ListResult {
        definitions: state.manager.registry().definitions(),
    })
}
