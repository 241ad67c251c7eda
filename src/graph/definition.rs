//! Declarative shape of a graph: its stages and how outputs are routed.

use crate::config::TenantSettings;
use crate::error::WorkflowError;
use crate::message::{AwaitingInput, WorkflowMessage};
use crate::state_machine::{Phase, Ticket, WorkflowState};

use super::context::AgentContext;

/// What a stage does when the cursor reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    /// Invoke one step. `effect` marks steps with side effects outside the
    /// core, which are never re-run once they have completed.
    Step { step: &'static str, effect: bool },
    /// Invoke several side-effecting steps concurrently and join their outputs.
    Parallel { steps: &'static [&'static str] },
    /// Persist a checkpoint and wait for external input.
    Await(AwaitingInput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: &'static str,
    /// Ticket state entered when the stage starts.
    pub enters: Option<WorkflowState>,
    pub action: StageAction,
}

impl StageDescriptor {
    pub const fn step(name: &'static str, step: &'static str) -> Self {
        Self {
            name,
            enters: None,
            action: StageAction::Step { step, effect: false },
        }
    }

    pub const fn effect(name: &'static str, step: &'static str) -> Self {
        Self {
            name,
            enters: None,
            action: StageAction::Step { step, effect: true },
        }
    }

    pub const fn parallel(name: &'static str, steps: &'static [&'static str]) -> Self {
        Self {
            name,
            enters: None,
            action: StageAction::Parallel { steps },
        }
    }

    pub const fn await_input(name: &'static str, awaiting: AwaitingInput) -> Self {
        Self {
            name,
            enters: None,
            action: StageAction::Await(awaiting),
        }
    }

    pub const fn entering(mut self, state: WorkflowState) -> Self {
        self.enters = Some(state);
        self
    }

    pub fn has_effects(&self) -> bool {
        matches!(
            self.action,
            StageAction::Step { effect: true, .. } | StageAction::Parallel { .. }
        )
    }
}

/// Where the cursor goes after a stage's output has been routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Goto {
        stage: &'static str,
        message: WorkflowMessage,
    },
    Complete(WorkflowMessage),
}

impl Next {
    pub fn goto(stage: &'static str, message: WorkflowMessage) -> Self {
        Next::Goto { stage, message }
    }
}

/// Revision loop bounds shared by every graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionLimits {
    pub plan: u32,
    pub ticket_update: u32,
}

impl Default for RevisionLimits {
    fn default() -> Self {
        Self {
            plan: 5,
            ticket_update: 3,
        }
    }
}

/// Routing function of a graph: maps a stage's output (or the external
/// input accepted by an await stage) to the next cursor position.
pub type RouteFn = fn(&mut Routing<'_>, &str, WorkflowMessage) -> Result<Next, WorkflowError>;

pub struct GraphDefinition {
    pub phase: Phase,
    /// The first stage is the entry point.
    pub stages: Vec<StageDescriptor>,
    pub route: RouteFn,
}

impl GraphDefinition {
    pub fn name(&self) -> &'static str {
        self.phase.graph_name()
    }

    pub fn stage(&self, name: &str) -> Result<&StageDescriptor, WorkflowError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| WorkflowError::UnknownStage(format!("{}::{name}", self.name())))
    }

    pub fn entry(&self) -> Result<&StageDescriptor, WorkflowError> {
        self.stages
            .first()
            .ok_or_else(|| WorkflowError::UnknownStage(format!("{}::<entry>", self.name())))
    }
}

/// What a route function may touch while deciding the next stage.
pub struct Routing<'a> {
    ticket: &'a mut Ticket,
    context: &'a mut AgentContext,
    limits: RevisionLimits,
}

impl<'a> Routing<'a> {
    pub(crate) fn new(ticket: &'a mut Ticket, context: &'a mut AgentContext, limits: RevisionLimits) -> Self {
        Self {
            ticket,
            context,
            limits,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.ticket.state()
    }

    pub fn transition(&mut self, to: WorkflowState, reason: impl Into<String>) -> Result<(), WorkflowError> {
        self.ticket.transition_to(to, reason)
    }

    pub fn context(&mut self) -> &mut AgentContext {
        &mut *self.context
    }

    pub fn settings(&self) -> &TenantSettings {
        self.context.settings()
    }

    pub fn limits(&self) -> RevisionLimits {
        self.limits
    }

    /// Count one rejection of `revision` and gather its feedback.
    ///
    /// Returns the message re-entering the generation stage, or
    /// `MaxRetriesExceeded` once more than `max` revisions were asked for.
    pub fn request_revision(
        &mut self,
        revision: &str,
        max: u32,
        feedback: String,
    ) -> Result<WorkflowMessage, WorkflowError> {
        let attempt = self.context.bump_revision(revision);
        if attempt > max {
            return Err(WorkflowError::MaxRetriesExceeded {
                revision: revision.to_string(),
                max,
            });
        }
        let feedback = self.context.push(&format!("feedback.{revision}"), feedback)?;
        Ok(WorkflowMessage::RevisionRequested { attempt, feedback })
    }
}

/// Error for an output a stage's routing has no rule for.
pub fn unexpected(stage: &str, message: &WorkflowMessage) -> WorkflowError {
    WorkflowError::UnexpectedMessage {
        stage: stage.to_string(),
        message: message.kind().to_string(),
    }
}
