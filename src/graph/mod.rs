//! Checkpointed, resumable graphs of agent steps.
//!
//! A [`Graph`] walks a [`GraphDefinition`] from its entry stage, invoking
//! steps through the [`AgentExecutor`] and routing each output to the next
//! stage. Await stages persist a checkpoint and suspend; [`Graph::resume`]
//! rebuilds the run from that checkpoint. Side-effecting stages also write
//! an in-flight checkpoint carrying completion markers, so a run interrupted
//! between stages continues without repeating finished effects.

mod context;
mod definition;
pub mod implementation;
pub mod planning;
pub mod refinement;
mod retry;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use context::{AgentContext, ContextSnapshot};
pub use definition::{
    GraphDefinition, Next, RevisionLimits, RouteFn, Routing, StageAction, StageDescriptor, unexpected,
};
pub use retry::RetryPolicy;

use context::effect_marker;
use retry::invoke_with_retry;

use crate::error::WorkflowError;
use crate::message::{AwaitingInput, BranchOutput, ExternalInput, WorkflowMessage};
use crate::ports::events::publish_quietly;
use crate::ports::{AgentExecutor, CheckpointStore, EventPublisher, EventType, Metadata};
use crate::state_machine::{Phase, Ticket, TicketId, WorkflowEvent};

/// Engine settings shared by every graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSettings {
    pub retry: RetryPolicy,
    /// Deadline for a single step attempt.
    pub step_timeout: Duration,
    pub limits: RevisionLimits,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(300),
            limits: RevisionLimits::default(),
        }
    }
}

/// How a call to [`Graph::execute`] or [`Graph::resume`] ended.
#[derive(Debug)]
pub enum GraphExecutionResult {
    Completed {
        message: WorkflowMessage,
    },
    Suspended {
        message: WorkflowMessage,
        awaiting: AwaitingInput,
    },
    Failed {
        stage: String,
        error: WorkflowError,
    },
}

impl GraphExecutionResult {
    pub fn is_suspended(&self) -> bool {
        matches!(self, GraphExecutionResult::Suspended { .. })
    }

    pub fn output_message(&self) -> Option<&WorkflowMessage> {
        match self {
            GraphExecutionResult::Completed { message } | GraphExecutionResult::Suspended { message, .. } => {
                Some(message)
            }
            GraphExecutionResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            GraphExecutionResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Where a graph currently stands for a ticket, read from its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatus {
    pub graph: String,
    pub current_stage: Option<String>,
    pub is_suspended: bool,
    pub awaiting: Option<AwaitingInput>,
}

/// Everything a graph needs to pick a run back up.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointPayload {
    /// Message at the cursor: the await stage's input while suspended, or
    /// the input of the last side-effecting stage while in flight.
    message: WorkflowMessage,
    awaiting: Option<AwaitingInput>,
    context: ContextSnapshot,
    applied_inputs: BTreeSet<String>,
    /// Ticket history at save time, replayed if the ticket store lags behind.
    events: Vec<WorkflowEvent>,
}

/// Build the definition of the graph that runs `phase`.
pub fn definition_for(phase: Phase) -> GraphDefinition {
    match phase {
        Phase::Refinement => refinement::definition(),
        Phase::Planning => planning::definition(),
        Phase::Implementation => implementation::definition(),
    }
}

/// A checkpointed graph over injected collaborators.
pub struct Graph {
    definition: GraphDefinition,
    executor: Arc<dyn AgentExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventPublisher>,
    settings: GraphSettings,
}

impl Graph {
    pub fn new(
        definition: GraphDefinition,
        executor: Arc<dyn AgentExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<dyn EventPublisher>,
        settings: GraphSettings,
    ) -> Self {
        Self {
            definition,
            executor,
            checkpoints,
            events,
            settings,
        }
    }

    pub fn name(&self) -> &'static str {
        self.definition.name()
    }

    pub fn phase(&self) -> Phase {
        self.definition.phase
    }

    /// Run from the entry stage with `message` until the graph suspends,
    /// completes, or fails.
    ///
    /// Workflow failures come back as [`GraphExecutionResult::Failed`]; `Err`
    /// is reserved for storage errors.
    pub async fn execute(
        &self,
        ticket: &mut Ticket,
        message: WorkflowMessage,
        context: &mut AgentContext,
    ) -> Result<GraphExecutionResult, WorkflowError> {
        let entry = self.definition.entry()?.name;
        info!(ticket_id = %ticket.id, graph = self.name(), input = message.kind(), "executing graph");
        self.publish(&ticket.id, EventType::GraphStarted, [("stage", entry.to_string())])
            .await;

        let mut applied = BTreeSet::new();
        self.run(ticket, context, entry, message, &mut applied).await
    }

    /// Continue from the stored checkpoint.
    ///
    /// A suspended graph applies `input` (ignoring a delivery id it has
    /// already applied) or, with no input, reports it is still suspended.
    /// An in-flight checkpoint is continued from its cursor and takes no input.
    pub async fn resume(
        &self,
        ticket: &mut Ticket,
        input: Option<ExternalInput>,
        context: &mut AgentContext,
    ) -> Result<GraphExecutionResult, WorkflowError> {
        let checkpoint = self
            .checkpoints
            .load(&ticket.id, self.name())
            .await?
            .ok_or_else(|| WorkflowError::NoCheckpointFound {
                ticket_id: ticket.id.to_string(),
                graph: self.name().to_string(),
            })?;
        let payload: CheckpointPayload = serde_json::from_slice(&checkpoint.payload)?;
        let stage = self.definition.stage(&checkpoint.stage)?;

        let Some(awaiting) = payload.awaiting else {
            // Only a redelivery of an input this run already applied is accepted.
            if let Some(input) = &input
                && !payload.applied_inputs.contains(&input.id)
            {
                return Err(WorkflowError::InputNotAccepted {
                    ticket_id: ticket.id.to_string(),
                    awaiting: "nothing (run in progress)".to_string(),
                    message: input.message.kind().to_string(),
                });
            }
            catch_up(ticket, &payload.events)?;
            context.restore(payload.context);
            info!(ticket_id = %ticket.id, graph = self.name(), stage = stage.name, "continuing interrupted run");
            self.publish(&ticket.id, EventType::GraphResumed, [("stage", stage.name.to_string())])
                .await;
            let mut applied = payload.applied_inputs;
            return self.run(ticket, context, stage.name, payload.message, &mut applied).await;
        };

        let Some(input) = input else {
            self.rejoin_await(ticket, stage, &payload.events)?;
            return Ok(GraphExecutionResult::Suspended {
                message: payload.message,
                awaiting,
            });
        };
        if payload.applied_inputs.contains(&input.id) {
            info!(ticket_id = %ticket.id, graph = self.name(), input_id = %input.id, "input already applied");
            self.rejoin_await(ticket, stage, &payload.events)?;
            self.publish(&ticket.id, EventType::DuplicateInput, [("input_id", input.id)])
                .await;
            return Ok(GraphExecutionResult::Suspended {
                message: payload.message,
                awaiting,
            });
        }
        if !awaiting.accepts(&input.message) {
            return Err(WorkflowError::InputNotAccepted {
                ticket_id: ticket.id.to_string(),
                awaiting: awaiting.to_string(),
                message: input.message.kind().to_string(),
            });
        }

        self.rejoin_await(ticket, stage, &payload.events)?;
        context.restore(payload.context);
        context.advance_generation();
        let mut applied = payload.applied_inputs;
        applied.insert(input.id.clone());

        info!(
            ticket_id = %ticket.id,
            graph = self.name(),
            stage = stage.name,
            input_id = %input.id,
            input = input.message.kind(),
            "resuming graph"
        );
        self.publish(
            &ticket.id,
            EventType::GraphResumed,
            [("stage", stage.name.to_string()), ("input_id", input.id)],
        )
        .await;

        match self.route(ticket, context, stage.name, input.message) {
            Ok(Next::Goto { stage: next, message }) => self.run(ticket, context, next, message, &mut applied).await,
            Ok(Next::Complete(message)) => self.complete(ticket, message).await,
            Err(error) => Ok(self.failed(ticket, stage.name, error).await),
        }
    }

    /// Read the graph's position for `ticket_id` from its checkpoint.
    pub async fn status(&self, ticket_id: &TicketId) -> Result<GraphStatus, WorkflowError> {
        let Some(checkpoint) = self.checkpoints.load(ticket_id, self.name()).await? else {
            return Ok(GraphStatus {
                graph: self.name().to_string(),
                current_stage: None,
                is_suspended: false,
                awaiting: None,
            });
        };
        let payload: CheckpointPayload = serde_json::from_slice(&checkpoint.payload)?;
        Ok(GraphStatus {
            graph: self.name().to_string(),
            current_stage: Some(checkpoint.stage),
            is_suspended: payload.awaiting.is_some(),
            awaiting: payload.awaiting,
        })
    }

    /// Bring the ticket back to the await stage's state: replay transitions
    /// it is missing, or re-enter the stage after an aborted run moved on.
    fn rejoin_await(
        &self,
        ticket: &mut Ticket,
        stage: &StageDescriptor,
        recorded: &[WorkflowEvent],
    ) -> Result<(), WorkflowError> {
        catch_up(ticket, recorded)?;
        if let Some(state) = stage.enters
            && ticket.state() != state
        {
            ticket.transition_to(state, format!("{} waiting at {}", self.name(), stage.name))?;
        }
        Ok(())
    }

    async fn run(
        &self,
        ticket: &mut Ticket,
        context: &mut AgentContext,
        mut stage_name: &'static str,
        mut message: WorkflowMessage,
        applied: &mut BTreeSet<String>,
    ) -> Result<GraphExecutionResult, WorkflowError> {
        loop {
            if context.is_cancelled() {
                return Ok(self.failed(ticket, stage_name, WorkflowError::Cancelled).await);
            }
            let stage = *self.definition.stage(stage_name)?;

            if let StageAction::Await(awaiting) = stage.action {
                return self.suspend(ticket, context, &stage, message, awaiting, applied).await;
            }

            if let Some(state) = stage.enters
                && ticket.state() != state
                && let Err(error) = ticket.transition_to(state, format!("{} entered {}", self.name(), stage.name))
            {
                return Ok(self.failed(ticket, stage.name, error).await);
            }
            debug!(ticket_id = %ticket.id, graph = self.name(), stage = stage.name, input = message.kind(), "stage started");
            self.publish(&ticket.id, EventType::StageStarted, [("stage", stage.name.to_string())])
                .await;

            let output = match stage.action {
                StageAction::Step { step, effect } => self.run_step(step, effect, &message, context).await,
                StageAction::Parallel { steps } => self.run_parallel(stage.name, steps, &message, context).await,
                StageAction::Await(_) => Err(WorkflowError::UnknownStage(stage.name.to_string())),
            };

            if stage.has_effects() {
                self.save_checkpoint(ticket, stage.name, &message, None, context, applied)
                    .await?;
            }
            let output = match output {
                Ok(output) => output,
                Err(error) => return Ok(self.failed(ticket, stage.name, error).await),
            };

            match self.route(ticket, context, stage.name, output) {
                Ok(Next::Goto { stage: next, message: next_message }) => {
                    stage_name = next;
                    message = next_message;
                }
                Ok(Next::Complete(message)) => return self.complete(ticket, message).await,
                Err(error) => return Ok(self.failed(ticket, stage.name, error).await),
            }
        }
    }

    async fn run_step(
        &self,
        step: &str,
        effect: bool,
        input: &WorkflowMessage,
        context: &mut AgentContext,
    ) -> Result<WorkflowMessage, WorkflowError> {
        let marker = effect_marker(step, context.generation());
        if effect && let Some(recorded) = context.effect(&marker) {
            info!(ticket_id = %context.ticket_id(), step, "step already completed, reusing its output");
            return Ok(recorded.clone());
        }

        let output = invoke_with_retry(
            self.executor.as_ref(),
            step,
            input,
            context,
            &self.settings.retry,
            self.settings.step_timeout,
        )
        .await?;
        if effect {
            context.record_effect(marker, output.clone());
        }
        Ok(output)
    }

    /// Run every branch to completion, then join. Successful branches are
    /// marked even when a sibling fails, so a retry only repeats the failures.
    async fn run_parallel(
        &self,
        stage: &str,
        steps: &'static [&'static str],
        input: &WorkflowMessage,
        context: &mut AgentContext,
    ) -> Result<WorkflowMessage, WorkflowError> {
        let generation = context.generation();
        let shared: &AgentContext = context;
        let results = join_all(steps.iter().map(|&step| async move {
            if let Some(recorded) = shared.effect(&effect_marker(step, generation)) {
                return (step, Ok(recorded.clone()), false);
            }
            let result = invoke_with_retry(
                self.executor.as_ref(),
                step,
                input,
                shared,
                &self.settings.retry,
                self.settings.step_timeout,
            )
            .await;
            (step, result, true)
        }))
        .await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (step, result, fresh) in results {
            match result {
                Ok(message) => {
                    if fresh {
                        context.record_effect(effect_marker(step, generation), message.clone());
                    }
                    outputs.push(BranchOutput {
                        step: step.to_string(),
                        message,
                    });
                }
                Err(error) => {
                    warn!(ticket_id = %context.ticket_id(), stage, step, error = %error, "parallel branch failed");
                    failures.push(format!("{step}: {error}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(WorkflowMessage::BranchesJoined { outputs })
        } else {
            Err(WorkflowError::BranchesFailed {
                stage: stage.to_string(),
                failures,
            })
        }
    }

    async fn suspend(
        &self,
        ticket: &mut Ticket,
        context: &AgentContext,
        stage: &StageDescriptor,
        message: WorkflowMessage,
        awaiting: AwaitingInput,
        applied: &BTreeSet<String>,
    ) -> Result<GraphExecutionResult, WorkflowError> {
        self.save_checkpoint(ticket, stage.name, &message, Some(awaiting), context, applied)
            .await?;
        if let Some(state) = stage.enters
            && ticket.state() != state
            && let Err(error) = ticket.transition_to(state, format!("{} waiting at {}", self.name(), stage.name))
        {
            return Ok(self.failed(ticket, stage.name, error).await);
        }

        info!(
            ticket_id = %ticket.id,
            graph = self.name(),
            stage = stage.name,
            %awaiting,
            "graph suspended"
        );
        self.publish(
            &ticket.id,
            EventType::GraphSuspended,
            [("stage", stage.name.to_string()), ("awaiting", format!("{awaiting:?}"))],
        )
        .await;
        Ok(GraphExecutionResult::Suspended { message, awaiting })
    }

    async fn complete(&self, ticket: &Ticket, message: WorkflowMessage) -> Result<GraphExecutionResult, WorkflowError> {
        self.checkpoints.delete(&ticket.id, self.name()).await?;
        info!(ticket_id = %ticket.id, graph = self.name(), output = message.kind(), "graph completed");
        self.publish(&ticket.id, EventType::GraphCompleted, [("output", message.kind().to_string())])
            .await;
        Ok(GraphExecutionResult::Completed { message })
    }

    /// The checkpoint is left in place for diagnosis.
    async fn failed(&self, ticket: &Ticket, stage: &str, error: WorkflowError) -> GraphExecutionResult {
        warn!(ticket_id = %ticket.id, graph = self.name(), stage, error = %error, "graph failed");
        self.publish(
            &ticket.id,
            EventType::GraphFailed,
            [("stage", stage.to_string()), ("error", error.to_string())],
        )
        .await;
        GraphExecutionResult::Failed {
            stage: stage.to_string(),
            error,
        }
    }

    fn route(
        &self,
        ticket: &mut Ticket,
        context: &mut AgentContext,
        stage: &str,
        output: WorkflowMessage,
    ) -> Result<Next, WorkflowError> {
        let mut routing = Routing::new(ticket, context, self.settings.limits);
        (self.definition.route)(&mut routing, stage, output)
    }

    async fn save_checkpoint(
        &self,
        ticket: &Ticket,
        stage: &str,
        message: &WorkflowMessage,
        awaiting: Option<AwaitingInput>,
        context: &AgentContext,
        applied: &BTreeSet<String>,
    ) -> Result<(), WorkflowError> {
        let payload = CheckpointPayload {
            message: message.clone(),
            awaiting,
            context: context.snapshot(),
            applied_inputs: applied.clone(),
            events: ticket.events().to_vec(),
        };
        self.checkpoints
            .save(&ticket.id, self.name(), stage, serde_json::to_vec(&payload)?)
            .await?;
        debug!(ticket_id = %ticket.id, graph = self.name(), stage, suspended = awaiting.is_some(), "checkpoint saved");
        Ok(())
    }

    async fn publish<const N: usize>(&self, ticket_id: &TicketId, event: EventType, fields: [(&str, String); N]) {
        let mut metadata = Metadata::new();
        metadata.insert("graph".to_string(), self.name().to_string());
        for (key, value) in fields {
            metadata.insert(key.to_string(), value);
        }
        publish_quietly(self.events.as_ref(), ticket_id, event, metadata).await;
    }
}

/// Replay transitions recorded in a checkpoint that the stored ticket is
/// missing, as happens when the process stopped between the two writes.
fn catch_up(ticket: &mut Ticket, recorded: &[WorkflowEvent]) -> Result<(), WorkflowError> {
    let known = ticket.events().len();
    if recorded.len() <= known {
        return Ok(());
    }
    let diverged = ticket
        .events()
        .iter()
        .zip(recorded)
        .any(|(have, saved)| have.from != saved.from || have.to != saved.to);
    if diverged {
        return Err(WorkflowError::CorruptHistory {
            ticket_id: ticket.id.to_string(),
            reason: "checkpoint history diverges from the stored ticket".to_string(),
        });
    }
    for event in &recorded[known..] {
        info!(ticket_id = %ticket.id, from = %event.from, to = %event.to, "replaying transition from checkpoint");
        ticket.transition_to(event.to, event.reason.clone())?;
    }
    Ok(())
}
