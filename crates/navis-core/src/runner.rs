//! Workflow runner: one in-memory executor per workflow instance.
//!
//! ```text
//!   WorkflowRunner::create / load
//!          │
//!          ▼
//!   runner.transaction(|tx| { tx.start(..)?; tx.trigger(..)?; ... })
//!          │            │
//!          │            └─ handlers get a WorkflowContext (memory, labels, steps)
//!          ▼
//!   pending RunnerOutput { mutations, messages, activities }
//!          │
//!          ▼
//!   runner.commit() ──▶ WorkflowManager persists the batch
//! ```
//!
//! Every action is only reachable through a [`WorkflowTransaction`], which
//! mutably borrows the runner. Calling an action outside a transaction, or
//! opening a second transaction inside the first, does not compile. If the
//! transaction closure returns an error, the state and the pending buffer are
//! restored to what they were when the transaction began.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::definition::{Lifecycle, WorkflowDefinition};
use crate::error::{Result, WorkflowError};
use crate::model::{
    DataMap, Participant, WorkflowActivity, WorkflowMessage, WorkflowStage, WorkflowState,
    WorkflowStep,
};
use crate::mutation::{Mutation, MutationEnvelope, StepUpdate, WorkflowUpdate};
use crate::router::EventTrigger;
use crate::state_machine::StateMachine;
use crate::status::{StageStatus, StepStatus, WorkflowStatus};
use crate::util::{is_state_label, scoped_id};

/// Records buffered by a runner since its last commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerOutput {
    pub mutations: Vec<MutationEnvelope>,
    pub messages: Vec<WorkflowMessage>,
    pub activities: Vec<WorkflowActivity>,
}

impl RunnerOutput {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.messages.is_empty() && self.activities.is_empty()
    }

    fn marks(&self) -> (usize, usize, usize) {
        (self.mutations.len(), self.messages.len(), self.activities.len())
    }

    fn truncate(&mut self, (mutations, messages, activities): (usize, usize, usize)) {
        self.mutations.truncate(mutations);
        self.messages.truncate(messages);
        self.activities.truncate(activities);
    }

    fn prepend(&mut self, earlier: RunnerOutput) {
        fn join<T>(mut front: Vec<T>, back: &mut Vec<T>) -> Vec<T> {
            front.append(back);
            front
        }
        self.mutations = join(earlier.mutations, &mut self.mutations);
        self.messages = join(earlier.messages, &mut self.messages);
        self.activities = join(earlier.activities, &mut self.activities);
    }
}

/// Runner state captured before a unit of work so it can be rolled back.
///
/// Only valid while nothing is committed between capture and rollback.
pub(crate) struct Checkpoint {
    state: WorkflowState,
    marks: (usize, usize, usize),
    counter: u64,
}

pub struct WorkflowRunner {
    def: Arc<WorkflowDefinition>,
    state: WorkflowState,
    pending: RunnerOutput,
    counter: u64,
    tx_id: Uuid,
    action: String,
}

impl fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("key", &self.def.key)
            .field("state", &self.state)
            .field("pending", &self.pending.mutations.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowRunner {
    /// Create a fresh instance in BLANK status with its initial steps.
    pub fn create(
        def: Arc<WorkflowDefinition>,
        resource_name: &str,
        resource_id: &str,
        params: DataMap,
        title: Option<String>,
    ) -> Result<Self> {
        if resource_id.trim().is_empty() {
            return Err(WorkflowError::Execution(format!(
                "Workflow [{}] requires a resource id",
                def.key
            )));
        }
        let state = WorkflowState {
            id: Uuid::new_v4(),
            key: def.key.clone(),
            revision: def.revision,
            title: title.unwrap_or_else(|| def.title.clone()),
            namespace: def.namespace.clone(),
            resource_name: resource_name.to_string(),
            resource_id: resource_id.to_string(),
            status: WorkflowStatus::Blank,
            paused: None,
            progress: 0.0,
            label: None,
            params,
            created_at: Utc::now(),
            ts_start: None,
            ts_finish: None,
            memory: DataMap::new(),
            steps: Vec::new(),
            stages: Vec::new(),
            participants: Vec::new(),
        };
        let mut runner = Self {
            def,
            state,
            pending: RunnerOutput::default(),
            counter: 0,
            tx_id: Uuid::new_v4(),
            action: String::new(),
        };
        runner.initialize()?;
        Ok(runner)
    }

    /// Rehydrate a runner from persisted state. Nothing is buffered.
    ///
    /// `last_order` is the highest audit order already persisted for the
    /// instance; new records continue after it.
    pub fn load(def: Arc<WorkflowDefinition>, state: WorkflowState, last_order: u64) -> Result<Self> {
        if state.key != def.key {
            return Err(WorkflowError::InvalidData(format!(
                "Workflow [{}] belongs to definition [{}], not [{}]",
                state.id, state.key, def.key
            )));
        }
        if state.revision != def.revision {
            tracing::warn!(
                workflow_id = %state.id,
                stored = state.revision,
                current = def.revision,
                "Loading workflow created by another definition revision"
            );
        }
        Ok(Self {
            def,
            state,
            pending: RunnerOutput::default(),
            counter: last_order,
            tx_id: Uuid::nil(),
            action: String::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn key(&self) -> &str {
        &self.def.key
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.def
    }

    pub fn step(&self, id: &Uuid) -> Option<&WorkflowStep> {
        self.state.step(id)
    }

    /// First instance of a step key.
    pub fn find_step(&self, step_key: &str) -> Option<&WorkflowStep> {
        self.state.steps_by_key(step_key).next()
    }

    pub fn pending(&self) -> &RunnerOutput {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Run `f` as one all-or-nothing unit of work.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkflowTransaction<'_>) -> Result<T>,
    {
        let checkpoint = self.checkpoint();
        self.tx_id = Uuid::new_v4();

        let result = f(&mut WorkflowTransaction { runner: self });
        if let Err(err) = &result {
            self.rollback(checkpoint);
            tracing::debug!(workflow_id = %self.state.id, error = %err, "Workflow transaction rolled back");
        }
        result
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.clone(),
            marks: self.pending.marks(),
            counter: self.counter,
        }
    }

    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.state = checkpoint.state;
        self.pending.truncate(checkpoint.marks);
        self.counter = checkpoint.counter;
    }

    /// Drain the pending buffer. A second call returns an empty output.
    pub fn commit(&mut self) -> RunnerOutput {
        std::mem::take(&mut self.pending)
    }

    /// Put a drained output back in front of anything buffered since.
    pub fn restore(&mut self, output: RunnerOutput) {
        self.pending.prepend(output);
    }

    // ─── Record helpers ─────────────────────────────────────────────────

    fn next_order(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn record_activity(&mut self, name: &str, args: Value, step_id: Option<Uuid>) {
        self.action = name.to_string();
        let order = self.next_order();
        self.pending.activities.push(WorkflowActivity {
            id: Uuid::new_v4(),
            workflow_id: self.state.id,
            transaction_id: self.tx_id,
            name: name.to_string(),
            args,
            step_id,
            order,
            created_at: Utc::now(),
        });
    }

    fn emit(&mut self, mutation: Mutation, step_id: Option<Uuid>) {
        let order = self.next_order();
        self.pending.mutations.push(MutationEnvelope {
            id: Uuid::new_v4(),
            workflow_id: self.state.id,
            transaction_id: self.tx_id,
            action: self.action.clone(),
            step_id,
            order,
            created_at: Utc::now(),
            mutation,
        });
    }

    fn narrate(&mut self, source: &str, step_id: Option<Uuid>, lines: Vec<String>) {
        for content in lines {
            let order = self.next_order();
            self.pending.messages.push(WorkflowMessage {
                id: Uuid::new_v4(),
                workflow_id: self.state.id,
                transaction_id: self.tx_id,
                step_id,
                source: source.to_string(),
                content,
                order,
                created_at: Utc::now(),
            });
        }
    }

    fn touch_workflow(&mut self) {
        let update = WorkflowUpdate::from(&self.state);
        self.emit(Mutation::UpdateWorkflow(update), None);
    }

    fn touch_step(&mut self, idx: usize) {
        let step = &self.state.steps[idx];
        let (id, update) = (step.id, StepUpdate::from(step));
        self.emit(Mutation::UpdateStep(update), Some(id));
    }

    // ─── Guards ─────────────────────────────────────────────────────────

    fn require(&self, allowed: &[WorkflowStatus], what: &str) -> Result<()> {
        if allowed.contains(&self.state.status) {
            Ok(())
        } else {
            Err(WorkflowError::Execution(format!(
                "Cannot {} workflow in status {}",
                what, self.state.status
            )))
        }
    }

    fn step_position(&self, id: &Uuid) -> Result<usize> {
        self.state
            .steps
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "Step [{}] not found in workflow [{}]",
                    id, self.state.id
                ))
            })
    }

    fn require_open_step(&self, idx: usize, what: &str) -> Result<()> {
        let step = &self.state.steps[idx];
        if step.status.is_finished() {
            return Err(WorkflowError::Execution(format!(
                "Cannot {} step [{}] in status {}",
                what, step.step_key, step.status
            )));
        }
        Ok(())
    }

    fn focused(&self, step_id: Option<Uuid>) -> Result<Uuid> {
        step_id.ok_or_else(|| {
            WorkflowError::Execution(format!(
                "Handler in workflow [{}] is not bound to a step",
                self.def.key
            ))
        })
    }

    // ─── Core operations ────────────────────────────────────────────────

    fn initialize(&mut self) -> Result<()> {
        let args = json!({
            "resource_name": self.state.resource_name,
            "resource_id": self.state.resource_id,
            "params": self.state.params,
        });
        self.record_activity("create", args, None);
        self.emit(
            Mutation::InitializeWorkflow {
                workflow: self.state.clone(),
            },
            None,
        );

        let def = self.def.clone();
        for stage in &def.stages {
            let stage = WorkflowStage {
                id: scoped_id(&self.state.id, &format!("stage:{}", stage.key)),
                workflow_id: self.state.id,
                key: stage.key.clone(),
                title: stage.title.clone(),
                order: stage.order,
                stage_type: stage.stage_type.clone(),
                desc: stage.desc.clone(),
                status: StageStatus::Active,
            };
            self.state.stages.push(stage.clone());
            self.emit(Mutation::AddStage { stage }, None);
        }
        for step in def.initial_steps() {
            self.insert_step(&step.key, None, None, None)?;
        }
        Ok(())
    }

    fn insert_step(
        &mut self,
        step_key: &str,
        selector: Option<String>,
        title: Option<String>,
        src_step: Option<Uuid>,
    ) -> Result<Uuid> {
        let def = self.def.clone();
        let sdef = def.step(step_key).ok_or_else(|| {
            WorkflowError::NotFound(format!(
                "Step [{}] is not defined in workflow [{}]",
                step_key, def.key
            ))
        })?;

        let index = self.state.steps_by_key(step_key).count() as u32;
        if !sdef.multi && index > 0 {
            return Err(WorkflowError::Execution(format!(
                "Step [{}] already exists in workflow [{}]",
                step_key, self.state.id
            )));
        }
        let workflow_id = self.state.id;
        let id = if sdef.multi {
            scoped_id(&workflow_id, &format!("step:{}#{}", step_key, index))
        } else {
            scoped_id(&workflow_id, &format!("step:{}", step_key))
        };
        let selector = selector.unwrap_or_else(|| id.to_string());
        if self
            .state
            .steps_by_key(step_key)
            .any(|s| s.selector == selector)
        {
            return Err(WorkflowError::Execution(format!(
                "Step [{}] with selector [{}] already exists",
                step_key, selector
            )));
        }

        let step = WorkflowStep {
            id,
            workflow_id,
            step_key: sdef.key.clone(),
            title: title.unwrap_or_else(|| sdef.title.clone()),
            stage_key: sdef.stage.clone(),
            index,
            selector,
            label: sdef.start.clone(),
            status: StepStatus::Active,
            src_step,
            message: None,
            ts_start: Utc::now(),
            ts_finish: None,
            memory: DataMap::new(),
        };
        self.state.steps.push(step.clone());
        self.emit(Mutation::AddStep { step }, Some(id));
        Ok(id)
    }

    fn transit(&mut self, step_id: Uuid, target: &str, args: &Value) -> Result<()> {
        let idx = self.step_position(&step_id)?;
        self.require_open_step(idx, "transit")?;

        let def = self.def.clone();
        let step_key = self.state.steps[idx].step_key.clone();
        let sdef = def.step(&step_key).ok_or_else(|| {
            WorkflowError::NotFound(format!(
                "Step [{}] is not defined in workflow [{}]",
                step_key, def.key
            ))
        })?;
        let transition = StateMachine::new(sdef).check(&self.state.steps[idx].label, target)?;
        let before = self.state.steps[idx].status;

        let lines = (transition.handler)(&mut WorkflowContext::new(self, Some(step_id)), args)?;
        self.narrate(&step_key, Some(step_id), lines);

        let idx = self.step_position(&step_id)?;
        let step = &mut self.state.steps[idx];
        step.label = transition.target.clone();
        // A status set by the handler itself wins over the finish label.
        if sdef.finishes_on(&step.label) && step.status == before {
            step.status = StepStatus::Completed;
            step.ts_finish = Some(Utc::now());
        }
        self.touch_step(idx);
        Ok(())
    }

    fn set_step_status(
        &mut self,
        step_id: Uuid,
        status: StepStatus,
        message: Option<String>,
        what: &str,
    ) -> Result<()> {
        let idx = self.step_position(&step_id)?;
        self.require_open_step(idx, what)?;
        let step = &mut self.state.steps[idx];
        step.status = status;
        if message.is_some() {
            step.message = message;
        }
        if status.is_finished() {
            step.ts_finish = Some(Utc::now());
        }
        self.touch_step(idx);
        Ok(())
    }

    fn apply_memory(&mut self, step_id: Option<Uuid>, updates: DataMap) -> Result<()> {
        let memory = match step_id {
            None => {
                self.state.memory.extend(updates);
                self.state.memory.clone()
            }
            Some(id) => {
                let idx = self.step_position(&id)?;
                let memory = &mut self.state.steps[idx].memory;
                memory.extend(updates);
                memory.clone()
            }
        };
        self.emit(Mutation::SetMemory { memory }, step_id);
        Ok(())
    }

    fn run_hook(&mut self, at: Lifecycle, args: &Value) -> Result<()> {
        if let Some(hook) = self.def.hook(at) {
            let lines = hook(&mut WorkflowContext::new(self, None), args)?;
            self.narrate(at.as_str(), None, lines);
        }
        Ok(())
    }

    /// Recompute progress and derive the workflow status from its steps.
    fn reconcile(&mut self) -> Result<()> {
        let total = self.state.steps.len();
        let finished = self
            .state
            .steps
            .iter()
            .filter(|s| s.status.is_finished())
            .count();
        let errored = self
            .state
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Error);
        let progress = if total == 0 {
            0.0
        } else {
            finished as f64 / total as f64
        };

        let status = match self.state.status {
            WorkflowStatus::Active | WorkflowStatus::Error if errored => WorkflowStatus::Error,
            WorkflowStatus::Active | WorkflowStatus::Error if total > 0 && finished == total => {
                WorkflowStatus::Completed
            }
            WorkflowStatus::Error => WorkflowStatus::Active,
            other => other,
        };
        if progress == self.state.progress && status == self.state.status {
            return Ok(());
        }

        let completed = status == WorkflowStatus::Completed && self.state.status != status;
        self.state.progress = progress;
        self.state.status = status;
        if completed {
            self.state.ts_finish = Some(Utc::now());
        }
        self.touch_workflow();

        if completed {
            tracing::info!(workflow_id = %self.state.id, key = %self.def.key, "Workflow completed");
            self.run_hook(Lifecycle::Finish, &Value::Null)?;
        }
        Ok(())
    }
}

/// Handle for the actions of one runner transaction.
pub struct WorkflowTransaction<'r> {
    runner: &'r mut WorkflowRunner,
}

const OPEN: &[WorkflowStatus] = &[
    WorkflowStatus::Blank,
    WorkflowStatus::Active,
    WorkflowStatus::Paused,
    WorkflowStatus::Error,
];

impl<'r> WorkflowTransaction<'r> {
    pub fn id(&self) -> Uuid {
        self.runner.tx_id
    }

    pub fn state(&self) -> &WorkflowState {
        &self.runner.state
    }

    /// BLANK → ACTIVE, then run the start hook.
    pub fn start(&mut self, params: DataMap) -> Result<()> {
        let r = &mut *self.runner;
        r.require(&[WorkflowStatus::Blank], "start")?;
        let args = Value::Object(params);
        r.record_activity("start", args.clone(), None);
        r.state.status = WorkflowStatus::Active;
        r.state.ts_start = Some(Utc::now());
        r.touch_workflow();

        r.run_hook(Lifecycle::Start, &args)?;
        if r.state.steps.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "Workflow [{}] has no steps after start",
                r.def.key
            )));
        }
        r.reconcile()
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> Result<()> {
        let r = &mut *self.runner;
        r.require(OPEN, "rename")?;
        let title = title.into();
        r.record_activity("set_title", json!({ "title": title }), None);
        r.state.title = title;
        r.touch_workflow();
        Ok(())
    }

    pub fn add_participant(&mut self, user_id: &str, role: &str) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::EDITABLE, "add participants to")?;
        if !r.def.has_role(role) {
            return Err(WorkflowError::Execution(format!(
                "Role [{}] is not declared in workflow [{}]",
                role, r.def.key
            )));
        }
        if r.state.has_participant(user_id, role) {
            return Ok(());
        }
        let args = json!({ "user_id": user_id, "role": role });
        r.record_activity("add_participant", args.clone(), None);
        let participant = Participant {
            id: scoped_id(&r.state.id, &format!("participant:{}:{}", role, user_id)),
            workflow_id: r.state.id,
            user_id: user_id.to_string(),
            role: role.to_string(),
        };
        r.state.participants.push(participant.clone());
        r.emit(Mutation::AddParticipant { participant }, None);
        r.run_hook(Lifecycle::AddParticipant, &args)
    }

    /// Remove a participant from one role, or from every role when `role` is `None`.
    pub fn remove_participant(&mut self, user_id: &str, role: Option<&str>) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::EDITABLE, "remove participants from")?;
        let before = r.state.participants.len();
        r.state
            .participants
            .retain(|p| !(p.user_id == user_id && role.map_or(true, |role| p.role == role)));
        if r.state.participants.len() == before {
            return Err(WorkflowError::NotFound(format!(
                "Participant [{}] not found in workflow [{}]",
                user_id, r.state.id
            )));
        }
        let args = json!({ "user_id": user_id, "role": role });
        r.record_activity("remove_participant", args.clone(), None);
        r.emit(
            Mutation::DelParticipant {
                user_id: user_id.to_string(),
                role: role.map(String::from),
            },
            None,
        );
        r.run_hook(Lifecycle::RemoveParticipant, &args)
    }

    /// Apply a routed event to this instance.
    pub fn trigger(&mut self, trigger: &EventTrigger) -> Result<()> {
        let r = &mut *self.runner;
        if trigger.workflow_key != r.def.key {
            return Err(WorkflowError::Execution(format!(
                "Event [{}] targets workflow [{}], not [{}]",
                trigger.event, trigger.workflow_key, r.def.key
            )));
        }
        if !r.state.status.is_running() {
            return Err(WorkflowError::Execution(format!(
                "Cannot process event [{}] in workflow status {}",
                trigger.event, r.state.status
            )));
        }

        let step_id = match (&trigger.step_key, &trigger.step_selector) {
            (Some(step_key), Some(selector)) => {
                let step = r
                    .state
                    .steps_by_key(step_key)
                    .find(|s| &s.selector == selector)
                    .ok_or_else(|| {
                        WorkflowError::NotFound(format!(
                            "Step [{}] with selector [{}] not found in workflow [{}]",
                            step_key, selector, r.state.id
                        ))
                    })?;
                Some(step.id)
            }
            (Some(step_key), None) => {
                return Err(WorkflowError::Execution(format!(
                    "Event [{}] for step [{}] carries no step selector",
                    trigger.event, step_key
                )))
            }
            (None, _) => None,
        };
        if let Some(id) = step_id {
            let idx = r.step_position(&id)?;
            r.require_open_step(idx, "trigger")?;
        }

        let args = Value::Object(trigger.data.clone());
        r.record_activity(
            "trigger",
            json!({ "event": trigger.event, "data": args }),
            step_id,
        );
        let lines = (trigger.handler)(&mut WorkflowContext::new(r, step_id), &args)?;
        r.narrate(&trigger.event, step_id, lines);
        r.run_hook(Lifecycle::Trigger, &args)?;
        r.reconcile()
    }

    pub fn transit_step(&mut self, step_id: Uuid, target: &str, args: Value) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "transit steps in")?;
        r.record_activity(
            "transit_step",
            json!({ "to_state": target, "args": args }),
            Some(step_id),
        );
        r.transit(step_id, target, &args)?;
        r.reconcile()
    }

    pub fn add_step(
        &mut self,
        step_key: &str,
        selector: Option<String>,
        title: Option<String>,
    ) -> Result<Uuid> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "add steps to")?;
        r.record_activity(
            "add_step",
            json!({ "step_key": step_key, "selector": selector, "title": title }),
            None,
        );
        let id = r.insert_step(step_key, selector, title, None)?;
        r.reconcile()?;
        Ok(id)
    }

    pub fn set_memory(&mut self, updates: DataMap) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "update memory of")?;
        r.record_activity("set_memory", Value::Object(updates.clone()), None);
        r.apply_memory(None, updates)
    }

    pub fn set_step_memory(&mut self, step_id: Uuid, updates: DataMap) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "update memory of")?;
        r.record_activity("set_step_memory", Value::Object(updates.clone()), Some(step_id));
        r.apply_memory(Some(step_id), updates)
    }

    /// ACTIVE or ERROR → PAUSED. The prior status is kept for `resume`.
    pub fn pause(&mut self) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "pause")?;
        r.record_activity("pause", Value::Null, None);
        r.state.paused = Some(r.state.status);
        r.state.status = WorkflowStatus::Paused;
        r.touch_workflow();
        r.run_hook(Lifecycle::Pause, &Value::Null)
    }

    pub fn resume(&mut self) -> Result<()> {
        let r = &mut *self.runner;
        r.require(&[WorkflowStatus::Paused], "resume")?;
        r.record_activity("resume", Value::Null, None);
        r.state.status = r.state.paused.take().unwrap_or(WorkflowStatus::Active);
        r.touch_workflow();
        r.run_hook(Lifecycle::Resume, &Value::Null)?;
        r.reconcile()
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.close(WorkflowStatus::Cancelled, Lifecycle::Cancel)
    }

    /// Terminate the workflow as FAILED.
    pub fn abort(&mut self) -> Result<()> {
        self.close(WorkflowStatus::Failed, Lifecycle::Abort)
    }

    fn close(&mut self, status: WorkflowStatus, at: Lifecycle) -> Result<()> {
        let r = &mut *self.runner;
        r.require(OPEN, at.as_str())?;
        r.record_activity(at.as_str(), Value::Null, None);
        r.state.status = status;
        r.state.paused = None;
        r.state.ts_finish = Some(Utc::now());
        r.touch_workflow();
        r.run_hook(at, &Value::Null)
    }

    pub fn ignore_step(&mut self, step_id: Uuid, reason: Option<String>) -> Result<()> {
        self.close_step(step_id, StepStatus::Skipped, reason, "ignore")
    }

    pub fn cancel_step(&mut self, step_id: Uuid, reason: Option<String>) -> Result<()> {
        self.close_step(step_id, StepStatus::Aborted, reason, "cancel")
    }

    /// Flag a step as ERROR. The workflow moves to ERROR with it.
    pub fn fail_step(&mut self, step_id: Uuid, message: Option<String>) -> Result<()> {
        self.close_step(step_id, StepStatus::Error, message, "fail")
    }

    /// ERROR → ACTIVE for one step.
    pub fn recover_step(&mut self, step_id: Uuid) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, "recover steps in")?;
        let idx = r.step_position(&step_id)?;
        let step = &r.state.steps[idx];
        if step.status != StepStatus::Error {
            return Err(WorkflowError::Execution(format!(
                "Cannot recover step [{}] in status {}",
                step.step_key, step.status
            )));
        }
        r.record_activity("recover_step", Value::Null, Some(step_id));
        let step = &mut r.state.steps[idx];
        step.status = StepStatus::Active;
        step.message = None;
        r.touch_step(idx);
        r.reconcile()
    }

    fn close_step(
        &mut self,
        step_id: Uuid,
        status: StepStatus,
        reason: Option<String>,
        what: &str,
    ) -> Result<()> {
        let r = &mut *self.runner;
        r.require(WorkflowStatus::RUNNING, &format!("{} steps in", what))?;
        r.record_activity(
            &format!("{}_step", what),
            json!({ "reason": reason }),
            Some(step_id),
        );
        r.set_step_status(step_id, status, reason, what)?;
        r.reconcile()
    }
}

/// View of a runner handed to handlers. Step-bound handlers (transitions and
/// step-scoped events) also see the step they act on.
///
/// Writes are only accepted while the workflow is running (ACTIVE or ERROR),
/// the same rule the matching transaction actions follow. Hooks that run
/// after a workflow closed can read state and narrate, nothing else.
pub struct WorkflowContext<'a> {
    runner: &'a mut WorkflowRunner,
    step_id: Option<Uuid>,
}

impl<'a> WorkflowContext<'a> {
    fn new(runner: &'a mut WorkflowRunner, step_id: Option<Uuid>) -> Self {
        Self { runner, step_id }
    }

    pub fn workflow(&self) -> &WorkflowState {
        &self.runner.state
    }

    pub fn params(&self) -> &DataMap {
        &self.runner.state.params
    }

    pub fn memory(&self) -> &DataMap {
        &self.runner.state.memory
    }

    pub fn step_id(&self) -> Option<Uuid> {
        self.step_id
    }

    pub fn step(&self) -> Option<&WorkflowStep> {
        self.step_id.and_then(|id| self.runner.state.step(&id))
    }

    pub fn steps(&self, step_key: &str) -> Vec<&WorkflowStep> {
        self.runner.state.steps_by_key(step_key).collect()
    }

    fn writable(&self, what: &str) -> Result<()> {
        self.runner.require(WorkflowStatus::RUNNING, what)
    }

    pub fn set_memory(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.writable("update memory of")?;
        let mut updates = DataMap::new();
        updates.insert(key.into(), value);
        self.runner.apply_memory(None, updates)
    }

    pub fn set_step_memory(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.writable("update memory of")?;
        let id = self.runner.focused(self.step_id)?;
        let mut updates = DataMap::new();
        updates.insert(key.into(), value);
        self.runner.apply_memory(Some(id), updates)
    }

    /// Set the coarse workflow label (an upper-case state token).
    pub fn set_label(&mut self, label: impl Into<String>) -> Result<()> {
        self.writable("relabel")?;
        let label = label.into();
        if !is_state_label(&label) {
            return Err(WorkflowError::Execution(format!(
                "Invalid workflow label [{}]",
                label
            )));
        }
        self.runner.state.label = Some(label);
        self.runner.touch_workflow();
        Ok(())
    }

    pub fn set_step_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.writable("update steps in")?;
        let id = self.runner.focused(self.step_id)?;
        let idx = self.runner.step_position(&id)?;
        self.runner.state.steps[idx].message = Some(message.into());
        self.runner.touch_step(idx);
        Ok(())
    }

    /// Spawn a step. The current step, if any, is recorded as its source.
    pub fn add_step(&mut self, step_key: &str, selector: Option<String>) -> Result<Uuid> {
        self.writable("add steps to")?;
        self.runner.insert_step(step_key, selector, None, self.step_id)
    }

    pub fn transit(&mut self, step_id: Uuid, target: &str, args: &Value) -> Result<()> {
        self.writable("transit steps in")?;
        self.runner.transit(step_id, target, args)
    }

    /// Transit the step this handler is bound to.
    pub fn transit_step(&mut self, target: &str, args: &Value) -> Result<()> {
        self.writable("transit steps in")?;
        let id = self.runner.focused(self.step_id)?;
        self.runner.transit(id, target, args)
    }

    pub fn fail_step(&mut self, message: impl Into<String>) -> Result<()> {
        self.writable("fail steps in")?;
        let id = self.runner.focused(self.step_id)?;
        self.runner
            .set_step_status(id, StepStatus::Error, Some(message.into()), "fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Role, SourceStates, Stage, StepBuilder, WorkflowBuilder, ALL_STATES};
    use crate::registry::WorkflowRegistry;
    use crate::router::EventData;

    fn loan_application() -> WorkflowBuilder {
        WorkflowBuilder::new("Loan Application")
            .stage(Stage::new("intake", "Intake"))
            .stage(Stage::new("decision", "Decision"))
            .role(Role::new("applicant", "Applicant"))
            .role(Role::new("officer", "Loan Officer"))
            .step(
                StepBuilder::new("review", "Document Review", "intake")
                    .states(["CREATED", "RUNNING", "DONE"])
                    .start("CREATED")
                    .initial()
                    .finish_on(["DONE"])
                    .transition("RUNNING", SourceStates::only(["CREATED"]), |ctx, _| {
                        ctx.set_step_memory("started", json!(true))?;
                        Ok(vec!["Review started".to_string()])
                    })
                    .allow("DONE", SourceStates::only(["RUNNING"])),
            )
            .step(
                StepBuilder::new("signature", "Signature", "decision")
                    .multi()
                    .states(["PENDING", "SIGNED"])
                    .finish_on(["SIGNED"])
                    .allow("SIGNED", ALL_STATES)
                    .on_event("document-signed", |ctx, data| {
                        ctx.transit_step("SIGNED", data)?;
                        Ok(vec!["Signature received".to_string()])
                    }),
            )
            .on_event("documents-uploaded", |ctx, data| {
                let count = data.get("count").cloned().unwrap_or(Value::Null);
                ctx.set_memory("documents", count)?;
                Ok(vec!["Documents received".to_string()])
            })
            .on_finish(|ctx, _| Ok(vec![format!("{} finished", ctx.workflow().title)]))
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register(loan_application()).unwrap();
        registry
    }

    fn runner(registry: &WorkflowRegistry) -> WorkflowRunner {
        let def = registry.get("loan-application").unwrap();
        WorkflowRunner::create(def, "application", "A-1", DataMap::new(), None).unwrap()
    }

    fn started(registry: &WorkflowRegistry) -> WorkflowRunner {
        let mut runner = runner(registry);
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();
        runner
    }

    fn review_id(runner: &WorkflowRunner) -> Uuid {
        runner.find_step("review").unwrap().id
    }

    fn kinds(output: &RunnerOutput) -> Vec<&'static str> {
        output.mutations.iter().map(|m| m.kind()).collect()
    }

    #[test]
    fn test_create_buffers_initial_records() {
        let registry = registry();
        let runner = runner(&registry);

        assert_eq!(runner.status(), WorkflowStatus::Blank);
        let review = runner.find_step("review").unwrap();
        assert_eq!(review.label, "CREATED");
        assert_eq!(review.status, StepStatus::Active);
        assert!(runner.find_step("signature").is_none());
        assert_eq!(runner.state().stages.len(), 2);
        assert_eq!(runner.state().stages[1].order, 101);

        assert_eq!(
            kinds(runner.pending()),
            vec!["initialize-workflow", "add-stage", "add-stage", "add-step"]
        );
        assert_eq!(runner.pending().activities.len(), 1);
        assert_eq!(runner.pending().activities[0].name, "create");
    }

    #[test]
    fn test_create_requires_resource_id() {
        let registry = registry();
        let def = registry.get("loan-application").unwrap();
        let err = WorkflowRunner::create(def, "application", " ", DataMap::new(), None).unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
    }

    #[test]
    fn test_start_twice_fails() {
        let registry = registry();
        let mut runner = started(&registry);
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert!(runner.state().ts_start.is_some());

        let err = runner.transaction(|tx| tx.start(DataMap::new())).unwrap_err();
        assert!(
            err.to_string().contains("Cannot start workflow in status ACTIVE"),
            "{}",
            err
        );
        assert_eq!(runner.status(), WorkflowStatus::Active);
    }

    #[test]
    fn test_transition_guard_and_handler_effects() {
        let registry = registry();
        let mut runner = started(&registry);
        let id = review_id(&runner);

        runner
            .transaction(|tx| tx.transit_step(id, "RUNNING", Value::Null))
            .unwrap();
        let step = runner.step(&id).unwrap();
        assert_eq!(step.label, "RUNNING");
        assert_eq!(step.memory.get("started"), Some(&json!(true)));
        let last = runner.pending().messages.last().unwrap();
        assert_eq!(last.content, "Review started");
        assert_eq!(last.source, "review");

        let err = runner
            .transaction(|tx| tx.transit_step(id, "RUNNING", Value::Null))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
        assert!(err.to_string().contains("from state [RUNNING]"), "{}", err);
        assert_eq!(runner.step(&id).unwrap().label, "RUNNING");
    }

    #[test]
    fn test_failed_transaction_discards_everything() {
        let registry = registry();
        let mut runner = started(&registry);
        let id = review_id(&runner);
        let before = runner.pending().clone();

        let result = runner.transaction(|tx| {
            tx.transit_step(id, "RUNNING", Value::Null)?;
            tx.add_participant("u-1", "applicant")?;
            tx.transit_step(id, "RUNNING", Value::Null)
        });
        assert!(result.is_err());
        assert_eq!(runner.step(&id).unwrap().label, "CREATED");
        assert!(runner.step(&id).unwrap().memory.is_empty());
        assert!(runner.state().participants.is_empty());
        assert_eq!(runner.pending(), &before);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let registry = registry();
        let mut runner = started(&registry);
        let output = runner.commit();
        assert!(!output.is_empty());
        assert!(runner.commit().is_empty());
        assert!(runner.commit().is_empty());
        assert!(!runner.has_pending());
    }

    #[test]
    fn test_mutation_order_is_monotonic() {
        let registry = registry();
        let runner = started(&registry);
        let orders: Vec<u64> = runner.pending().mutations.iter().map(|m| m.order).collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]), "{:?}", orders);
        assert!(runner
            .pending()
            .mutations
            .iter()
            .all(|m| m.workflow_id == runner.id()));
    }

    #[test]
    fn test_finishing_all_steps_completes_workflow() {
        let registry = registry();
        let mut runner = started(&registry);
        let id = review_id(&runner);
        runner.commit();

        runner
            .transaction(|tx| {
                tx.transit_step(id, "RUNNING", Value::Null)?;
                tx.transit_step(id, "DONE", Value::Null)
            })
            .unwrap();

        assert_eq!(runner.step(&id).unwrap().status, StepStatus::Completed);
        assert_eq!(runner.status(), WorkflowStatus::Completed);
        assert_eq!(runner.state().progress, 1.0);
        assert!(runner.state().ts_finish.is_some());
        let messages: Vec<&str> = runner
            .pending()
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(messages, vec!["Review started", "Loan Application finished"]);
    }

    #[test]
    fn test_participant_rules() {
        let registry = registry();
        let mut runner = runner(&registry);

        runner
            .transaction(|tx| tx.add_participant("u-1", "applicant"))
            .unwrap();
        runner
            .transaction(|tx| tx.add_participant("u-1", "applicant"))
            .unwrap();
        assert_eq!(runner.state().participants.len(), 1);

        let err = runner
            .transaction(|tx| tx.add_participant("u-2", "auditor"))
            .unwrap_err();
        assert!(err.to_string().contains("Role [auditor]"), "{}", err);

        let err = runner
            .transaction(|tx| tx.remove_participant("u-9", None))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));

        runner
            .transaction(|tx| tx.remove_participant("u-1", Some("applicant")))
            .unwrap();
        assert!(runner.state().participants.is_empty());

        runner.transaction(|tx| tx.cancel()).unwrap();
        let err = runner
            .transaction(|tx| tx.add_participant("u-1", "officer"))
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Cannot add participants to workflow in status CANCELLED"),
            "{}",
            err
        );
    }

    #[test]
    fn test_multi_steps_get_distinct_ids() {
        let registry = registry();
        let mut runner = started(&registry);

        let (a, b) = runner
            .transaction(|tx| {
                let a = tx.add_step("signature", Some("sig-a".into()), None)?;
                let b = tx.add_step("signature", Some("sig-b".into()), Some("Co-signer".into()))?;
                Ok((a, b))
            })
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(runner.step(&a).unwrap().index, 0);
        assert_eq!(runner.step(&b).unwrap().index, 1);
        assert_eq!(runner.step(&b).unwrap().title, "Co-signer");
        assert_eq!(runner.step(&a).unwrap().label, "PENDING");

        let dup = runner.transaction(|tx| tx.add_step("signature", Some("sig-a".into()), None));
        assert!(dup.is_err());
        let single = runner.transaction(|tx| tx.add_step("review", None, None));
        assert!(single.is_err());
        assert_eq!(runner.state().steps.len(), 3);
    }

    #[test]
    fn test_step_event_is_resolved_by_selector() {
        let registry = registry();
        let mut runner = started(&registry);
        let sig = runner
            .transaction(|tx| tx.add_step("signature", Some("sig-a".into()), None))
            .unwrap();

        let data = EventData::new("application", "A-1").selector("sig-a");
        let trigger = registry
            .router()
            .route("document-signed", &data)
            .next()
            .unwrap()
            .unwrap();
        runner.transaction(|tx| tx.trigger(&trigger)).unwrap();

        let step = runner.step(&sig).unwrap();
        assert_eq!(step.label, "SIGNED");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(runner.state().progress, 0.5);
        assert_eq!(
            runner.pending().activities.last().unwrap().step_id,
            Some(sig)
        );

        let unknown = EventData::new("application", "A-1").selector("sig-z");
        let trigger = registry
            .router()
            .route("document-signed", &unknown)
            .next()
            .unwrap()
            .unwrap();
        let err = runner.transaction(|tx| tx.trigger(&trigger)).unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[test]
    fn test_paused_workflow_rejects_events() {
        let registry = registry();
        let mut runner = started(&registry);
        let data = EventData::new("application", "A-1").with("count", json!(3));
        let trigger = registry
            .router()
            .route("documents-uploaded", &data)
            .next()
            .unwrap()
            .unwrap();

        runner.transaction(|tx| tx.pause()).unwrap();
        assert_eq!(runner.state().paused, Some(WorkflowStatus::Active));
        let err = runner.transaction(|tx| tx.trigger(&trigger)).unwrap_err();
        assert!(err.to_string().contains("in workflow status PAUSED"), "{}", err);

        runner.transaction(|tx| tx.resume()).unwrap();
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.state().paused, None);

        runner.transaction(|tx| tx.trigger(&trigger)).unwrap();
        assert_eq!(runner.state().memory.get("documents"), Some(&json!(3)));
        let set_memory = runner
            .pending()
            .mutations
            .iter()
            .rev()
            .find(|m| m.kind() == "set-memory")
            .unwrap();
        assert_eq!(set_memory.action, "trigger");
        assert_eq!(set_memory.step_id, None);
    }

    #[test]
    fn test_step_error_and_recovery_drive_workflow_status() {
        let registry = registry();
        let mut runner = started(&registry);
        let id = review_id(&runner);

        runner
            .transaction(|tx| tx.fail_step(id, Some("missing payslip".into())))
            .unwrap();
        assert_eq!(runner.status(), WorkflowStatus::Error);
        assert_eq!(
            runner.step(&id).unwrap().message.as_deref(),
            Some("missing payslip")
        );

        let err = runner.transaction(|tx| tx.recover_step(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));

        runner.transaction(|tx| tx.recover_step(id)).unwrap();
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.step(&id).unwrap().status, StepStatus::Active);

        runner
            .transaction(|tx| tx.ignore_step(id, Some("waived".into())))
            .unwrap();
        assert_eq!(runner.step(&id).unwrap().status, StepStatus::Skipped);
        assert_eq!(runner.status(), WorkflowStatus::Completed);

        let err = runner
            .transaction(|tx| tx.cancel_step(id, None))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
    }

    #[test]
    fn test_cancel_and_abort_are_terminal() {
        let registry = registry();
        let mut runner = started(&registry);
        runner.transaction(|tx| tx.abort()).unwrap();
        assert_eq!(runner.status(), WorkflowStatus::Failed);
        assert!(runner.transaction(|tx| tx.cancel()).is_err());
        assert!(runner.transaction(|tx| tx.pause()).is_err());
    }

    #[test]
    fn test_restore_puts_output_back_in_front() {
        let registry = registry();
        let mut runner = started(&registry);
        let first = runner.commit();
        runner.transaction(|tx| tx.pause()).unwrap();

        runner.restore(first.clone());
        let all = runner.commit();
        assert_eq!(all.mutations.len(), first.mutations.len() + 1);
        assert_eq!(all.mutations[0], first.mutations[0]);
        assert_eq!(all.mutations.last().unwrap().action, "pause");
    }

    #[test]
    fn test_load_rejects_foreign_state() {
        let registry = registry();
        let runner = runner(&registry);
        let mut state = runner.state().clone();
        state.key = "other".into();
        let def = registry.get("loan-application").unwrap();
        assert!(matches!(
            WorkflowRunner::load(def, state, 0),
            Err(WorkflowError::InvalidData(_))
        ));
    }

    #[test]
    fn test_reloaded_runner_continues_order() {
        let registry = registry();
        let mut runner = started(&registry);
        let first = runner.commit();
        let last = first
            .mutations
            .iter()
            .map(|m| m.order)
            .chain(first.activities.iter().map(|a| a.order))
            .chain(first.messages.iter().map(|m| m.order))
            .max()
            .unwrap();

        let def = registry.get("loan-application").unwrap();
        let mut reloaded = WorkflowRunner::load(def, runner.state().clone(), last).unwrap();
        reloaded.transaction(|tx| tx.pause()).unwrap();
        let next = reloaded.commit();
        assert!(next.activities.iter().all(|a| a.order > last));
        assert!(next.mutations.iter().all(|m| m.order > last));
    }

    #[test]
    fn test_find_step_accepts_temporary_key() {
        let registry = registry();
        let runner = started(&registry);
        let step = runner.find_step(&format!("{}view", "re")).unwrap();
        assert_eq!(step.step_key, "review");
    }

    #[test]
    fn test_multi_step_ids_do_not_collide_with_single_steps() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowBuilder::new("Signing")
                    .stage(Stage::new("sign", "Sign"))
                    .step(StepBuilder::new("sig", "Signature", "sign").multi().states(["OPEN"]))
                    .step(
                        StepBuilder::new("sig-0", "First Signature", "sign")
                            .states(["OPEN"])
                            .initial(),
                    ),
            )
            .unwrap();
        let def = registry.get("signing").unwrap();
        let mut runner = WorkflowRunner::create(def, "contract", "C-1", DataMap::new(), None).unwrap();
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();

        let multi = runner
            .transaction(|tx| tx.add_step("sig", Some("alice".into()), None))
            .unwrap();
        let single = runner.find_step("sig-0").unwrap().id;
        assert_eq!(runner.step(&multi).unwrap().index, 0);
        assert_ne!(multi, single);
        assert_eq!(runner.state().steps.len(), 2);
    }

    fn narrated(
        at: Lifecycle,
    ) -> impl Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static
    {
        move |ctx: &mut WorkflowContext<'_>, _: &Value| {
            Ok(vec![format!("{} while {}", at.as_str(), ctx.workflow().status)])
        }
    }

    fn hooked() -> WorkflowRegistry {
        let mut builder = loan_application();
        for at in [
            Lifecycle::Pause,
            Lifecycle::Resume,
            Lifecycle::Cancel,
            Lifecycle::Abort,
            Lifecycle::Trigger,
            Lifecycle::AddParticipant,
            Lifecycle::RemoveParticipant,
        ] {
            builder = builder.on(at, narrated(at));
        }
        let mut registry = WorkflowRegistry::new();
        registry.register(builder).unwrap();
        registry
    }

    fn narration(runner: &WorkflowRunner) -> Vec<(String, String)> {
        runner
            .pending()
            .messages
            .iter()
            .map(|m| (m.source.clone(), m.content.clone()))
            .collect()
    }

    #[test]
    fn test_lifecycle_hooks_run_after_each_action() {
        let registry = hooked();
        let mut other = runner(&registry);
        let mut runner = runner(&registry);
        let data = EventData::new("application", "A-1").with("count", json!(2));
        let trigger = registry
            .router()
            .route("documents-uploaded", &data)
            .next()
            .unwrap()
            .unwrap();

        runner.transaction(|tx| tx.add_participant("u-1", "applicant")).unwrap();
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();
        runner.transaction(|tx| tx.trigger(&trigger)).unwrap();
        runner.transaction(|tx| tx.pause()).unwrap();
        runner.transaction(|tx| tx.resume()).unwrap();
        runner
            .transaction(|tx| tx.remove_participant("u-1", Some("applicant")))
            .unwrap();
        runner.transaction(|tx| tx.cancel()).unwrap();

        let expected: Vec<(String, String)> = [
            ("add_participant", "add_participant while BLANK"),
            ("documents-uploaded", "Documents received"),
            ("trigger", "trigger while ACTIVE"),
            ("pause", "pause while PAUSED"),
            ("resume", "resume while ACTIVE"),
            ("remove_participant", "remove_participant while ACTIVE"),
            ("cancel", "cancel while CANCELLED"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
        assert_eq!(narration(&runner), expected);

        other.transaction(|tx| tx.start(DataMap::new())).unwrap();
        other.transaction(|tx| tx.abort()).unwrap();
        assert_eq!(
            narration(&other),
            vec![("abort".to_string(), "abort while FAILED".to_string())]
        );
    }

    #[test]
    fn test_failing_hook_rolls_back_its_action() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(loan_application().on(Lifecycle::Pause, |_, _| {
                Err(WorkflowError::Execution("pause refused".into()))
            }))
            .unwrap();
        let mut runner = started(&registry);
        let before = runner.pending().clone();

        let err = runner.transaction(|tx| tx.pause()).unwrap_err();
        assert_eq!(err.to_string(), "Execution error: pause refused");
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.pending(), &before);
    }

    #[test]
    fn test_start_without_steps_is_a_configuration_error() {
        let intake = || {
            WorkflowBuilder::new("Intake")
                .stage(Stage::new("triage", "Triage"))
                .step(StepBuilder::new("check", "Check", "triage").states(["OPEN", "DONE"]))
        };
        let mut registry = WorkflowRegistry::new();
        registry.register(intake()).unwrap();
        let def = registry.get("intake").unwrap();
        let mut runner = WorkflowRunner::create(def, "ticket", "T-1", DataMap::new(), None).unwrap();

        let err = runner.transaction(|tx| tx.start(DataMap::new())).unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
        assert!(err.to_string().contains("has no steps after start"), "{}", err);
        assert_eq!(runner.status(), WorkflowStatus::Blank);

        let mut registry = WorkflowRegistry::new();
        registry
            .register(intake().on_start(|ctx, _| {
                ctx.add_step("check", None)?;
                Ok(vec![])
            }))
            .unwrap();
        let def = registry.get("intake").unwrap();
        let mut runner = WorkflowRunner::create(def, "ticket", "T-2", DataMap::new(), None).unwrap();
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.state().steps.len(), 1);
    }

    #[test]
    fn test_handler_failure_survives_finishing_transition() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowBuilder::new("Payout")
                    .stage(Stage::new("pay", "Pay"))
                    .step(
                        StepBuilder::new("transfer", "Transfer", "pay")
                            .states(["QUEUED", "SENT"])
                            .initial()
                            .finish_on(["SENT"])
                            .transition("SENT", SourceStates::only(["QUEUED"]), |ctx, _| {
                                ctx.fail_step("bank rejected transfer")?;
                                Ok(vec![])
                            }),
                    ),
            )
            .unwrap();
        let def = registry.get("payout").unwrap();
        let mut runner = WorkflowRunner::create(def, "payment", "P-1", DataMap::new(), None).unwrap();
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();
        let id = runner.find_step("transfer").unwrap().id;

        runner
            .transaction(|tx| tx.transit_step(id, "SENT", Value::Null))
            .unwrap();
        let step = runner.step(&id).unwrap();
        assert_eq!(step.label, "SENT");
        assert_eq!(step.status, StepStatus::Error);
        assert_eq!(step.message.as_deref(), Some("bank rejected transfer"));
        assert_eq!(runner.status(), WorkflowStatus::Error);
    }

    #[test]
    fn test_handlers_cannot_write_to_a_closed_workflow() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowBuilder::new("Archive")
                    .stage(Stage::new("file", "File"))
                    .step(
                        StepBuilder::new("store", "Store", "file")
                            .states(["OPEN", "DONE"])
                            .initial()
                            .finish_on(["DONE"])
                            .allow("DONE", ALL_STATES),
                    )
                    .on_finish(|ctx, _| {
                        ctx.set_memory("archived", json!(true))?;
                        Ok(vec![])
                    })
                    .on(Lifecycle::Cancel, |ctx, _| {
                        ctx.set_label("CANCELLED")?;
                        Ok(vec![])
                    }),
            )
            .unwrap();
        let def = registry.get("archive").unwrap();
        let mut runner = WorkflowRunner::create(def, "box", "B-1", DataMap::new(), None).unwrap();
        runner.transaction(|tx| tx.start(DataMap::new())).unwrap();
        let id = runner.find_step("store").unwrap().id;

        let err = runner
            .transaction(|tx| tx.transit_step(id, "DONE", Value::Null))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
        assert!(err.to_string().contains("in status COMPLETED"), "{}", err);
        assert_eq!(runner.status(), WorkflowStatus::Active);
        assert_eq!(runner.step(&id).unwrap().label, "OPEN");

        let err = runner.transaction(|tx| tx.cancel()).unwrap_err();
        assert!(err.to_string().contains("Cannot relabel workflow in status CANCELLED"), "{}", err);
        assert_eq!(runner.status(), WorkflowStatus::Active);
    }
}
