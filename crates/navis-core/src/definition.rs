//! Declarative workflow definitions.
//!
//! A workflow is declared once at startup with builders and validated as a
//! whole when it is registered:
//!
//! ```text
//! WorkflowBuilder ── stage(Stage) ── role(Role) ── step(StepBuilder) ── on_event(..)
//!        │                                              │
//!        │                                              └─ states / start / transition(target, sources, handler)
//!        ▼
//!  build() ──▶ WorkflowDefinition (immutable, shared behind Arc)
//! ```
//!
//! Validation is all-or-nothing: the first problem found aborts the build
//! with [`WorkflowError::Configuration`] and nothing is registered.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::router::{EventBinding, Subscription};
use crate::runner::WorkflowContext;
use crate::util::{is_declared_key, is_state_label, kebab_case};

/// Callback run by the engine: transition handlers, event handlers, and
/// lifecycle hooks. Returns narration lines, recorded as workflow messages.
pub type Handler =
    Arc<dyn Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync>;

pub(crate) fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub const DEFAULT_STAGE_TYPE: &str = "general";

/// Workflow actions a definition can hook into. A hook runs after its action
/// has been applied, inside the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Start,
    /// Every step finished and the workflow moved to COMPLETED.
    Finish,
    Pause,
    Resume,
    Cancel,
    Abort,
    /// Runs after the event handler of every routed event.
    Trigger,
    AddParticipant,
    RemoveParticipant,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Abort => "abort",
            Self::Trigger => "trigger",
            Self::AddParticipant => "add_participant",
            Self::RemoveParticipant => "remove_participant",
        }
    }
}

// ─── Stage & Role ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stage {
    pub key: String,
    pub title: String,
    /// Display order. 0 means "use declaration position" (100 + index).
    pub order: u32,
    pub stage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

impl Stage {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            order: 0,
            stage_type: DEFAULT_STAGE_TYPE.to_string(),
            desc: None,
        }
    }

    pub fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn stage_type(mut self, stage_type: impl Into<String>) -> Self {
        self.stage_type = stage_type.into();
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Role {
    pub key: String,
    pub title: String,
}

impl Role {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
        }
    }
}

// ─── Transitions ────────────────────────────────────────────────────────

/// States a transition may be taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "states", rename_all = "lowercase")]
pub enum SourceStates {
    /// Any current state, including the target itself.
    Any,
    Only(Vec<String>),
    /// Any current state except the listed ones.
    Except(Vec<String>),
}

/// Wildcard source: the transition is allowed from every state.
pub const ALL_STATES: SourceStates = SourceStates::Any;

impl SourceStates {
    pub fn only<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SourceStates::Only(states.into_iter().map(Into::into).collect())
    }

    pub fn except<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SourceStates::Except(states.into_iter().map(Into::into).collect())
    }

    pub fn admits(&self, current: &str) -> bool {
        match self {
            SourceStates::Any => true,
            SourceStates::Only(states) => states.iter().any(|s| s == current),
            SourceStates::Except(states) => !states.iter().any(|s| s == current),
        }
    }

    fn listed(&self) -> &[String] {
        match self {
            SourceStates::Any => &[],
            SourceStates::Only(states) | SourceStates::Except(states) => states,
        }
    }
}

/// A transition's name is its target state.
#[derive(Clone)]
pub struct Transition {
    pub target: String,
    pub sources: SourceStates,
    pub(crate) handler: Handler,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

// ─── Steps ──────────────────────────────────────────────────────────────

/// Validated step definition.
#[derive(Clone)]
pub struct StepDefinition {
    pub key: String,
    pub title: String,
    pub stage: String,
    /// Several instances may exist in one workflow.
    pub multi: bool,
    /// Instantiated when the workflow is created.
    pub initial: bool,
    pub states: Vec<String>,
    pub start: String,
    /// Entering one of these labels completes the step.
    pub finish_on: Vec<String>,
    pub transitions: Vec<Transition>,
}

impl StepDefinition {
    pub fn transition(&self, target: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.target == target)
    }

    pub fn has_state(&self, label: &str) -> bool {
        self.states.iter().any(|s| s == label)
    }

    pub fn finishes_on(&self, label: &str) -> bool {
        self.finish_on.iter().any(|s| s == label)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("key", &self.key)
            .field("stage", &self.stage)
            .field("states", &self.states)
            .field("start", &self.start)
            .field("transitions", &self.transitions)
            .finish_non_exhaustive()
    }
}

pub struct StepBuilder {
    key: String,
    title: String,
    stage: String,
    multi: bool,
    initial: bool,
    states: Vec<String>,
    start: Option<String>,
    finish_on: Vec<String>,
    transitions: Vec<Transition>,
    subscriptions: Vec<Subscription>,
}

impl StepBuilder {
    pub fn new(key: impl Into<String>, title: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            stage: stage.into(),
            multi: false,
            initial: false,
            states: Vec::new(),
            start: None,
            finish_on: Vec::new(),
            transitions: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Start label. Defaults to the first declared state.
    pub fn start(mut self, label: impl Into<String>) -> Self {
        self.start = Some(label.into());
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    pub fn finish_on<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.finish_on = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn transition<F>(mut self, target: impl Into<String>, sources: SourceStates, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.transitions.push(Transition {
            target: target.into(),
            sources,
            handler: handler(f),
        });
        self
    }

    /// Transition with no side effects besides the label change.
    pub fn allow(self, target: impl Into<String>, sources: SourceStates) -> Self {
        self.transition(target, sources, |_, _| Ok(Vec::new()))
    }

    /// Step-scoped event handler. Routed events must carry a step selector.
    pub fn on_event<F>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.subscribe(Subscription::new(event, f))
    }

    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    fn build(self, stages: &HashSet<&str>) -> Result<(StepDefinition, Vec<Subscription>)> {
        let key = self.key;
        let err = |msg: String| Err(WorkflowError::Configuration(format!("Step [{}]: {}", key, msg)));

        if !is_declared_key(&key) {
            return err("invalid step key, keys must match ^[a-z][a-z0-9_-]*$".into());
        }
        if !stages.contains(self.stage.as_str()) {
            return err(format!("stage [{}] is not declared", self.stage));
        }
        if self.states.is_empty() {
            return err("no states declared".into());
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if !is_state_label(state) {
                return err(format!("invalid state label [{}], labels must match ^[A-Z][A-Z0-9_]*$", state));
            }
            if !seen.insert(state.as_str()) {
                return err(format!("state [{}] is declared twice", state));
            }
        }

        let start = self.start.unwrap_or_else(|| self.states[0].clone());
        if !seen.contains(start.as_str()) {
            return err(format!("start state [{}] is not defined in step states", start));
        }
        for label in &self.finish_on {
            if !seen.contains(label.as_str()) {
                return err(format!("finish state [{}] is not defined in step states", label));
            }
        }

        let mut targets = HashSet::new();
        for t in &self.transitions {
            if !seen.contains(t.target.as_str()) {
                return err(format!("state [{}] is not defined in step states", t.target));
            }
            if !targets.insert(t.target.as_str()) {
                return err(format!("duplicated transition handler to state [{}]", t.target));
            }
            if let Some(source) = t.sources.listed().iter().find(|s| !seen.contains(s.as_str())) {
                return err(format!(
                    "transition [{}] lists unknown source state [{}]",
                    t.target, source
                ));
            }
        }

        let def = StepDefinition {
            key,
            title: self.title,
            stage: self.stage,
            multi: self.multi,
            initial: self.initial,
            states: self.states,
            start,
            finish_on: self.finish_on,
            transitions: self.transitions,
        };
        Ok((def, self.subscriptions))
    }
}

// ─── Workflow ───────────────────────────────────────────────────────────

/// Validated, immutable workflow definition.
pub struct WorkflowDefinition {
    pub key: String,
    pub title: String,
    pub revision: u32,
    pub namespace: Option<String>,
    pub desc: Option<String>,
    pub stages: Vec<Stage>,
    pub roles: Vec<Role>,
    pub steps: Vec<StepDefinition>,
    pub(crate) bindings: Vec<EventBinding>,
    hooks: HashMap<Lifecycle, Handler>,
    step_index: HashMap<String, usize>,
}

impl WorkflowDefinition {
    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.step_index.get(key).map(|&i| &self.steps[i])
    }

    pub fn stage(&self, key: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.key == key)
    }

    pub fn has_role(&self, key: &str) -> bool {
        self.roles.iter().any(|r| r.key == key)
    }

    pub fn initial_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| s.initial)
    }

    pub(crate) fn hook(&self, at: Lifecycle) -> Option<Handler> {
        self.hooks.get(&at).cloned()
    }

    /// Serializable description of the definition, without handlers.
    pub fn metadata(&self) -> DefinitionMetadata {
        let mut events: Vec<String> = Vec::new();
        for b in &self.bindings {
            if !events.contains(&b.event) {
                events.push(b.event.clone());
            }
        }
        DefinitionMetadata {
            key: self.key.clone(),
            title: self.title.clone(),
            revision: self.revision,
            namespace: self.namespace.clone(),
            desc: self.desc.clone(),
            stages: self.stages.clone(),
            roles: self.roles.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| StepMetadata {
                    key: s.key.clone(),
                    title: s.title.clone(),
                    stage: s.stage.clone(),
                    multi: s.multi,
                    initial: s.initial,
                    states: s.states.clone(),
                    start: s.start.clone(),
                    finish_on: s.finish_on.clone(),
                    transitions: s
                        .transitions
                        .iter()
                        .map(|t| TransitionMetadata {
                            target: t.target.clone(),
                            sources: t.sources.clone(),
                        })
                        .collect(),
                })
                .collect(),
            events,
        }
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("stages", &self.stages)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

pub struct WorkflowBuilder {
    key: Option<String>,
    title: String,
    revision: u32,
    namespace: Option<String>,
    desc: Option<String>,
    stages: Vec<Stage>,
    roles: Vec<Role>,
    steps: Vec<StepBuilder>,
    subscriptions: Vec<Subscription>,
    hooks: HashMap<Lifecycle, Handler>,
}

impl WorkflowBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            key: None,
            title: title.into(),
            revision: 1,
            namespace: None,
            desc: None,
            stages: Vec::new(),
            roles: Vec::new(),
            steps: Vec::new(),
            subscriptions: Vec::new(),
            hooks: HashMap::new(),
        }
    }

    /// Override the key derived from the title.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    /// Attach a lifecycle hook. A second hook for the same action replaces the first.
    pub fn on<F>(mut self, at: Lifecycle, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.hooks.insert(at, handler(f));
        self
    }

    pub fn on_start<F>(self, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.on(Lifecycle::Start, f)
    }

    pub fn on_finish<F>(self, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.on(Lifecycle::Finish, f)
    }

    /// Workflow-scoped event handler.
    pub fn on_event<F>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.subscribe(Subscription::new(event, f))
    }

    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub(crate) fn has_namespace(&self) -> bool {
        self.namespace.is_some()
    }

    /// The key this builder will register under.
    pub fn resolved_key(&self) -> String {
        self.key.clone().unwrap_or_else(|| kebab_case(&self.title))
    }

    /// Validate the declaration and produce an immutable definition.
    pub fn build(self) -> Result<WorkflowDefinition> {
        let key = self.resolved_key();
        if key.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "Workflow [{}] has no usable key",
                self.title
            )));
        }
        let fail = |msg: String| WorkflowError::Configuration(format!("Workflow [{}]: {}", key, msg));

        let mut stage_keys = HashSet::new();
        for stage in &self.stages {
            if !is_declared_key(&stage.key) {
                return Err(fail(format!("invalid stage key [{}]", stage.key)));
            }
            if !stage_keys.insert(stage.key.as_str()) {
                return Err(fail(format!("stage [{}] is declared twice", stage.key)));
            }
        }
        let mut role_keys = HashSet::new();
        for role in &self.roles {
            if !is_declared_key(&role.key) {
                return Err(fail(format!("invalid role key [{}]", role.key)));
            }
            if !role_keys.insert(role.key.as_str()) {
                return Err(fail(format!("role [{}] is declared twice", role.key)));
            }
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut step_index = HashMap::new();
        let mut bindings = Vec::new();
        for builder in self.steps {
            let (step, subscriptions) = builder.build(&stage_keys).map_err(|e| match e {
                WorkflowError::Configuration(msg) => fail(msg),
                other => other,
            })?;
            if step_index.insert(step.key.clone(), steps.len()).is_some() {
                return Err(fail(format!("step [{}] is declared twice", step.key)));
            }
            for s in subscriptions {
                bindings.push(s.bind(&key, Some(step.key.clone())));
            }
            steps.push(step);
        }
        // Step-scoped bindings connect before workflow-scoped ones.
        for s in self.subscriptions {
            bindings.push(s.bind(&key, None));
        }

        let mut stages = self.stages;
        for (idx, stage) in stages.iter_mut().enumerate() {
            if stage.order == 0 {
                stage.order = 100 + idx as u32;
            }
        }

        Ok(WorkflowDefinition {
            key,
            title: self.title,
            revision: self.revision,
            namespace: self.namespace,
            desc: self.desc,
            stages,
            roles: self.roles,
            steps,
            bindings,
            hooks: self.hooks,
            step_index,
        })
    }
}

// ─── Metadata export ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DefinitionMetadata {
    pub key: String,
    pub title: String,
    pub revision: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    pub stages: Vec<Stage>,
    pub roles: Vec<Role>,
    pub steps: Vec<StepMetadata>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepMetadata {
    pub key: String,
    pub title: String,
    pub stage: String,
    pub multi: bool,
    pub initial: bool,
    pub states: Vec<String>,
    pub start: String,
    pub finish_on: Vec<String>,
    pub transitions: Vec<TransitionMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionMetadata {
    pub target: String,
    pub sources: SourceStates,
}
