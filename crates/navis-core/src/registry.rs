//! Registry of workflow definitions and their event routing table.
//!
//! The registry is populated once at startup and then shared read-only
//! (behind an `Arc`) with the [`WorkflowManager`](crate::manager::WorkflowManager).

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{DefinitionMetadata, WorkflowBuilder, WorkflowDefinition};
use crate::error::{Result, WorkflowError};
use crate::router::{EventData, EventRouter, EventTrigger};

#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    order: Vec<String>,
    router: EventRouter,
    namespace: Option<String>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that stamps `namespace` on definitions declaring none.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Validate and register a workflow. On error nothing changes.
    pub fn register(&mut self, builder: WorkflowBuilder) -> Result<Arc<WorkflowDefinition>> {
        let builder = match &self.namespace {
            Some(ns) if !builder.has_namespace() => builder.namespace(ns.clone()),
            _ => builder,
        };
        let key = builder.resolved_key();
        if self.definitions.contains_key(&key) {
            return Err(WorkflowError::Configuration(format!(
                "Workflow [{}] is already registered",
                key
            )));
        }

        let def = Arc::new(builder.build()?);
        for binding in &def.bindings {
            self.router.connect(binding.clone());
        }
        self.definitions.insert(def.key.clone(), def.clone());
        self.order.push(def.key.clone());

        tracing::info!(
            key = %def.key,
            revision = def.revision,
            steps = def.steps.len(),
            "Registered workflow definition"
        );
        Ok(def)
    }

    pub fn get(&self, key: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow definition [{}]", key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.definitions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Keys in registration order.
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn route<'a>(
        &'a self,
        event: &str,
        data: &'a EventData,
    ) -> impl Iterator<Item = Result<EventTrigger>> + 'a {
        self.router.route(event, data)
    }

    /// Metadata of every definition, in registration order.
    pub fn definitions(&self) -> Vec<DefinitionMetadata> {
        self.order
            .iter()
            .filter_map(|key| self.definitions.get(key))
            .map(|def| def.metadata())
            .collect()
    }

    pub fn clear(&mut self) {
        self.definitions.clear();
        self.order.clear();
        self.router.clear();
    }
}
