//! Per-step finite-state machine.
//!
//! The machine is a pure view over a [`StepDefinition`]: it answers whether
//! a transition may be taken from the current label and hands back the
//! transition to run. Executing the handler and moving the label belongs to
//! the runner, which sets the new label exactly once after the handler
//! succeeds.

use crate::definition::{StepDefinition, Transition};
use crate::error::{Result, WorkflowError};

#[derive(Debug, Clone, Copy)]
pub struct StateMachine<'d> {
    step: &'d StepDefinition,
}

impl<'d> StateMachine<'d> {
    pub fn new(step: &'d StepDefinition) -> Self {
        Self { step }
    }

    /// Guard a transition out of `current`. Nothing is mutated on failure.
    pub fn check(&self, current: &str, transition: &str) -> Result<&'d Transition> {
        let t = self.step.transition(transition).ok_or_else(|| {
            WorkflowError::Execution(format!(
                "Step [{}] has no transition [{}]",
                self.step.key, transition
            ))
        })?;
        if !t.sources.admits(current) {
            return Err(WorkflowError::Execution(format!(
                "Step [{}] cannot transit to [{}] from state [{}]",
                self.step.key, transition, current
            )));
        }
        Ok(t)
    }
}
