//! Workflow manager: runner cache, event fan-out and persistence.
//!
//! The manager owns every live [`WorkflowRunner`], keyed both by the resource
//! it is bound to and by its id. Each runner sits behind its own async mutex
//! so independent instances can be driven in parallel by the host.
//!
//! Persisting a runner drains its buffered records, turns each mutation into
//! storage operations (one fixed handler per mutation kind), appends the
//! audit rows and applies the whole [`WriteBatch`] atomically. When storage
//! rejects the batch the drained records go back into the runner. Runners
//! that reached a finished status leave the cache once they are committed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::definition::WorkflowDefinition;
use crate::error::{Result, WorkflowError};
use crate::model::{DataMap, WorkflowState};
use crate::mutation::{Mutation, MutationEnvelope};
use crate::registry::WorkflowRegistry;
use crate::router::{EventData, EventTrigger};
use crate::runner::{RunnerOutput, WorkflowRunner};
use crate::storage::{to_record, Record, Table, WorkflowStorage, WriteBatch};

/// Shared handle to a cached runner.
pub type RunnerHandle = Arc<Mutex<WorkflowRunner>>;

#[derive(Default)]
struct RunnerCache {
    by_resource: HashMap<(String, String, String), RunnerHandle>,
    by_id: HashMap<(String, Uuid), RunnerHandle>,
    /// Every cached runner, in the order it entered the cache.
    order: Vec<RunnerHandle>,
}

impl RunnerCache {
    fn insert(&mut self, state: &WorkflowState, handle: RunnerHandle) -> RunnerHandle {
        let by_id = (state.key.clone(), state.id);
        if let Some(existing) = self.by_id.get(&by_id) {
            return existing.clone();
        }
        self.by_resource.insert(
            (
                state.key.clone(),
                state.resource_name.clone(),
                state.resource_id.clone(),
            ),
            handle.clone(),
        );
        self.by_id.insert(by_id, handle.clone());
        self.order.push(handle.clone());
        handle
    }

    fn remove(&mut self, handle: &RunnerHandle) {
        self.by_resource.retain(|_, h| !Arc::ptr_eq(h, handle));
        self.by_id.retain(|_, h| !Arc::ptr_eq(h, handle));
        self.order.retain(|h| !Arc::ptr_eq(h, handle));
    }
}

pub struct WorkflowManager {
    registry: Arc<WorkflowRegistry>,
    storage: Arc<dyn WorkflowStorage>,
    runners: RwLock<RunnerCache>,
}

impl WorkflowManager {
    pub fn new(registry: Arc<WorkflowRegistry>, storage: Arc<dyn WorkflowStorage>) -> Self {
        Self {
            registry,
            storage,
            runners: RwLock::new(RunnerCache::default()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn WorkflowStorage> {
        &self.storage
    }

    /// Number of cached runners.
    pub async fn cached(&self) -> usize {
        self.runners.read().await.order.len()
    }

    /// Create a new instance. Nothing is persisted until the runner is committed.
    pub async fn create_workflow(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
        params: DataMap,
        title: Option<String>,
    ) -> Result<RunnerHandle> {
        let def = self.registry.get(key)?;
        let runner = WorkflowRunner::create(def, resource_name, resource_id, params, title)?;
        let state = runner.state().clone();
        // A new instance replaces the resource entry. Older ids stay reachable.
        let handle = self
            .runners
            .write()
            .await
            .insert(&state, Arc::new(Mutex::new(runner)));

        tracing::info!(
            workflow_id = %state.id,
            key = %state.key,
            resource = %format!("{}/{}", state.resource_name, state.resource_id),
            "Created workflow"
        );
        Ok(handle)
    }

    pub async fn load_workflow(
        &self,
        key: &str,
        resource_name: &str,
        resource_id: &str,
    ) -> Result<RunnerHandle> {
        if resource_id.trim().is_empty() {
            return Err(WorkflowError::Execution(format!(
                "Cannot load workflow [{}] without a resource id",
                key
            )));
        }
        let cache_key = (
            key.to_string(),
            resource_name.to_string(),
            resource_id.to_string(),
        );
        if let Some(handle) = self.runners.read().await.by_resource.get(&cache_key) {
            return Ok(handle.clone());
        }

        let def = self.registry.get(key)?;
        let state = self
            .storage
            .fetch_workflow_state(key, resource_name, resource_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "Workflow [{}] for resource [{}/{}]",
                    key, resource_name, resource_id
                ))
            })?;
        self.hydrate(def, state).await
    }

    pub async fn load_workflow_by_id(&self, key: &str, id: Uuid) -> Result<RunnerHandle> {
        if let Some(handle) = self.runners.read().await.by_id.get(&(key.to_string(), id)) {
            return Ok(handle.clone());
        }

        let def = self.registry.get(key)?;
        let state = self
            .storage
            .fetch_workflow_state_by_id(key, id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow [{}] with id [{}]", key, id)))?;
        self.hydrate(def, state).await
    }

    async fn hydrate(&self, def: Arc<WorkflowDefinition>, state: WorkflowState) -> Result<RunnerHandle> {
        let snapshot = state.clone();
        let last_order = self.storage.last_order(state.id).await?;
        let runner = WorkflowRunner::load(def, state, last_order)?;
        let handle = self
            .runners
            .write()
            .await
            .insert(&snapshot, Arc::new(Mutex::new(runner)));
        tracing::debug!(workflow_id = %snapshot.id, key = %snapshot.key, "Loaded workflow");
        Ok(handle)
    }

    /// Route an event and apply it to every target instance, in routing order.
    ///
    /// The fan-out is all or nothing. Every target is loaded and locked before
    /// the first trigger runs, and when any trigger fails all targets are put
    /// back where they stood. Unrouted events touch nothing and return an
    /// empty list. The returned handles are unique, in routing order.
    pub async fn process_event(&self, event: &str, data: &EventData) -> Result<Vec<RunnerHandle>> {
        let triggers: Vec<EventTrigger> = self.registry.route(event, data).collect::<Result<_>>()?;
        if triggers.is_empty() {
            tracing::debug!(event, "No workflow handles event");
            return Ok(Vec::new());
        }

        let mut targets: Vec<RunnerHandle> = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let handle = self
                .load_workflow(
                    &trigger.workflow_key,
                    &trigger.resource_name,
                    &trigger.resource_id,
                )
                .await?;
            targets.push(handle);
        }
        let mut affected: Vec<RunnerHandle> = Vec::with_capacity(targets.len());
        for handle in &targets {
            if !affected.iter().any(|h| Arc::ptr_eq(h, handle)) {
                affected.push(handle.clone());
            }
        }

        // Address order, so two overlapping fan-outs never wait on each other.
        let mut ordered = affected.clone();
        ordered.sort_by_key(|h| Arc::as_ptr(h) as usize);
        let mut locked = Vec::with_capacity(ordered.len());
        for handle in ordered {
            let runner = handle.clone().lock_owned().await;
            let checkpoint = runner.checkpoint();
            locked.push((handle, runner, checkpoint));
        }

        let applied = triggers.iter().zip(&targets).try_for_each(|(trigger, handle)| {
            match locked.iter_mut().find(|(h, _, _)| Arc::ptr_eq(h, handle)) {
                Some((_, runner, _)) => runner.transaction(|tx| tx.trigger(trigger)),
                None => Ok(()),
            }
        });
        if let Err(err) = applied {
            for (_, mut runner, checkpoint) in locked {
                runner.rollback(checkpoint);
            }
            tracing::warn!(event, error = %err, "Rolled back event fan-out");
            return Err(err);
        }
        drop(locked);

        tracing::debug!(event, workflows = affected.len(), "Processed event");
        Ok(affected)
    }

    /// Persist one runner's buffered records. Returns the number of mutations written.
    ///
    /// A runner whose workflow is finished is evicted from the cache after a
    /// successful commit. Later loads read it back from storage.
    pub async fn commit_workflow(&self, handle: &RunnerHandle) -> Result<usize> {
        let mut runner = handle.lock().await;
        let output = runner.commit();
        if output.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        let result = match persist(&mut batch, &output) {
            Ok(()) => self.storage.apply(batch).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                tracing::info!(
                    workflow_id = %runner.id(),
                    mutations = output.mutations.len(),
                    messages = output.messages.len(),
                    activities = output.activities.len(),
                    "Committed workflow"
                );
                let finished = runner.status().is_finished().then(|| runner.id());
                drop(runner);
                if let Some(workflow_id) = finished {
                    self.runners.write().await.remove(handle);
                    tracing::debug!(%workflow_id, "Evicted finished workflow from cache");
                }
                Ok(output.mutations.len())
            }
            Err(err) => {
                tracing::error!(workflow_id = %runner.id(), error = %err, "Failed to commit workflow");
                runner.restore(output);
                Err(err)
            }
        }
    }

    /// Persist every cached runner. Stops at the first failing runner.
    pub async fn commit(&self) -> Result<usize> {
        let handles: Vec<RunnerHandle> = self.runners.read().await.order.clone();
        let mut total = 0;
        for handle in &handles {
            total += self.commit_workflow(handle).await?;
        }
        Ok(total)
    }
}

/// Translate drained runner records into storage operations.
///
/// Mutations are dispatched in buffer order, each followed by its audit row;
/// messages and activities are appended after them.
pub fn persist(batch: &mut WriteBatch, output: &RunnerOutput) -> Result<()> {
    for envelope in &output.mutations {
        match &envelope.mutation {
            Mutation::InitializeWorkflow { workflow } => persist_initialize_workflow(batch, workflow)?,
            Mutation::UpdateWorkflow(update) => batch.update(
                Table::Workflow,
                envelope.workflow_id.to_string(),
                to_record(update, &[])?,
            ),
            Mutation::AddStep { step } => {
                batch.insert(Table::WorkflowStep, to_record(step, &["memory"])?)
            }
            Mutation::UpdateStep(update) => {
                let step_id = envelope_step(envelope)?;
                batch.update(Table::WorkflowStep, step_id.to_string(), to_record(update, &[])?)
            }
            Mutation::SetMemory { memory } => persist_set_memory(batch, envelope, memory)?,
            Mutation::AddParticipant { participant } => {
                batch.upsert(Table::WorkflowParticipant, to_record(participant, &[])?)
            }
            Mutation::DelParticipant { user_id, role } => {
                let mut filter = Record::new();
                filter.insert("workflow_id".into(), json!(envelope.workflow_id));
                filter.insert("user_id".into(), json!(user_id));
                if let Some(role) = role {
                    filter.insert("role".into(), json!(role));
                }
                batch.delete(Table::WorkflowParticipant, filter)
            }
            Mutation::AddStage { stage } => batch.upsert(Table::WorkflowStage, to_record(stage, &[])?),
        }
        batch.insert(Table::WorkflowMutation, mutation_record(envelope)?);
    }
    for message in &output.messages {
        batch.insert(Table::WorkflowMessage, to_record(message, &[])?);
    }
    for activity in &output.activities {
        batch.insert(Table::WorkflowActivity, to_record(activity, &[])?);
    }
    Ok(())
}

fn persist_initialize_workflow(batch: &mut WriteBatch, workflow: &WorkflowState) -> Result<()> {
    batch.insert(Table::Workflow, to_record(workflow, &WorkflowState::EMBEDDED)?);
    Ok(())
}

fn persist_set_memory(
    batch: &mut WriteBatch,
    envelope: &MutationEnvelope,
    memory: &DataMap,
) -> Result<()> {
    let mut record = Record::new();
    let row_id = envelope.step_id.unwrap_or(envelope.workflow_id);
    record.insert("id".into(), json!(row_id));
    record.insert("workflow_id".into(), json!(envelope.workflow_id));
    record.insert("step_id".into(), json!(envelope.step_id));
    record.insert("memory".into(), Value::Object(memory.clone()));
    batch.upsert(Table::WorkflowMemory, record);
    Ok(())
}

fn envelope_step(envelope: &MutationEnvelope) -> Result<Uuid> {
    envelope.step_id.ok_or_else(|| {
        WorkflowError::InvalidData(format!(
            "Mutation [{}] of kind {} carries no step id",
            envelope.id,
            envelope.kind()
        ))
    })
}

fn mutation_record(envelope: &MutationEnvelope) -> Result<Record> {
    let row = json!({
        "id": envelope.id,
        "workflow_id": envelope.workflow_id,
        "transaction_id": envelope.transaction_id,
        "kind": envelope.kind(),
        "action": envelope.action,
        "step_id": envelope.step_id,
        "order": envelope.order,
        "payload": serde_json::to_value(&envelope.mutation)?,
        "created_at": envelope.created_at,
    });
    to_record(&row, &[])
}
