//! `navis definitions`: Export registered workflow definitions.

use clap::ValueEnum;
use navis_core::EngineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

pub fn render(state: &EngineState, format: Format) -> Result<String, String> {
    let definitions = state.manager.registry().definitions();
    match format {
        Format::Json => serde_json::to_string_pretty(&definitions)
            .map_err(|e| format!("Failed to serialize definitions: {}", e)),
        Format::Yaml => serde_yaml::to_string(&definitions)
            .map_err(|e| format!("Failed to serialize definitions: {}", e)),
    }
}

pub fn list(state: &EngineState, format: Format) -> Result<(), String> {
    println!("{}", render(state, format)?);
    Ok(())
}
