use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TenantSettings;
use crate::error::WorkflowError;
use crate::graph::{self, AgentContext, Graph, GraphExecutionResult, GraphSettings, GraphStatus};
use crate::message::{AwaitingInput, ExternalInput, WorkflowMessage};
use crate::ports::events::publish_quietly;
use crate::ports::{AgentExecutor, CheckpointStore, EventPublisher, EventType, Metadata, TicketRepository};
use crate::state_machine::{
    FailureInfo, Phase, StateMachine, TenantId, Ticket, TicketId, TicketSummary, WorkflowState,
};

/// Injected collaborators shared by every graph the orchestrator builds.
#[derive(Clone)]
pub struct Collaborators {
    pub tickets: Arc<dyn TicketRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: Arc<dyn EventPublisher>,
    pub executor: Arc<dyn AgentExecutor>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub graph: GraphSettings,
    pub tenants: BTreeMap<String, TenantSettings>,
}

impl OrchestratorSettings {
    pub fn tenant(&self, tenant_id: &TenantId) -> TenantSettings {
        self.tenants.get(tenant_id.as_str()).cloned().unwrap_or_default()
    }
}

/// Where a ticket stands after an orchestrator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    Suspended { awaiting: AwaitingInput },
    Completed,
    Failed { stage: String, reason: String },
    Cancelled,
    /// A run stopped between stages; `start` picks it back up.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub ticket_id: TicketId,
    pub state: WorkflowState,
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: OrchestrationOutcome,
}

impl OrchestrationResult {
    fn new(ticket: &Ticket, outcome: OrchestrationOutcome) -> Self {
        Self {
            ticket_id: ticket.id.clone(),
            state: ticket.state(),
            phase: ticket.phase,
            outcome,
        }
    }

    /// Describe a ticket nobody is currently running.
    pub fn from_ticket(ticket: &Ticket) -> Self {
        let outcome = match (ticket.state(), ticket.awaiting) {
            (WorkflowState::Completed, _) => OrchestrationOutcome::Completed,
            (WorkflowState::Cancelled, _) => OrchestrationOutcome::Cancelled,
            (WorkflowState::Failed, _) => match &ticket.failure {
                Some(failure) => OrchestrationOutcome::Failed {
                    stage: failure.stage.clone(),
                    reason: failure.reason.clone(),
                },
                None => OrchestrationOutcome::Failed {
                    stage: String::new(),
                    reason: "unknown".to_string(),
                },
            },
            (_, Some(awaiting)) => OrchestrationOutcome::Suspended { awaiting },
            (_, None) => OrchestrationOutcome::Interrupted,
        };
        Self::new(ticket, outcome)
    }
}

/// What to do after a graph returned.
#[derive(Debug)]
pub enum GraphTransition {
    /// Start the next phase's graph with `message`.
    Chain { phase: Phase, message: WorkflowMessage },
    /// Stop driving the ticket.
    Finish(OrchestrationOutcome),
}

/// Everything known about a ticket, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatus {
    pub summary: TicketSummary,
    pub graph: GraphStatus,
}

/// Drives tickets across the refinement, planning and implementation graphs.
///
/// Calls for the same ticket are serialized; different tickets run
/// independently.
pub struct WorkflowOrchestrator {
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    locks: Mutex<HashMap<TicketId, Arc<Mutex<()>>>>,
    cancellations: Mutex<HashMap<TicketId, CancellationToken>>,
}

impl WorkflowOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        Self {
            collaborators,
            settings,
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Begin (or continue) work on a ticket.
    ///
    /// Creates the ticket on first sight. A ticket already suspended is
    /// reported as is; one interrupted mid-run continues from its checkpoint.
    pub async fn start(
        &self,
        tenant_id: &TenantId,
        ticket_id: &TicketId,
    ) -> Result<OrchestrationResult, WorkflowError> {
        let guard = self.lock_ticket(ticket_id).await;
        let result = self.start_locked(tenant_id, ticket_id).await;
        self.unlock_ticket(ticket_id, guard).await;
        result
    }

    async fn start_locked(
        &self,
        tenant_id: &TenantId,
        ticket_id: &TicketId,
    ) -> Result<OrchestrationResult, WorkflowError> {
        let mut ticket = match self.load_ticket(ticket_id).await? {
            Some(ticket) => ticket,
            None => {
                let ticket = Ticket::new(ticket_id.clone(), tenant_id.clone());
                self.collaborators.tickets.save(&ticket).await?;
                info!(ticket_id = %ticket_id, tenant_id = %tenant_id, "ticket created");
                ticket
            }
        };
        if ticket.tenant_id != *tenant_id {
            return Err(WorkflowError::TenantMismatch {
                ticket_id: ticket_id.to_string(),
                expected: ticket.tenant_id.to_string(),
                actual: tenant_id.to_string(),
            });
        }
        if ticket.is_terminal() || ticket.awaiting.is_some() {
            info!(ticket_id = %ticket_id, state = %ticket.state(), "ticket already started");
            return Ok(OrchestrationResult::from_ticket(&ticket));
        }

        let token = self.cancellation_token(ticket_id).await;
        let graph = self.graph_for(ticket.phase);
        let mut context = self.context_for(&ticket, &token);
        let mut published = ticket.events().len();
        let result = if graph.status(&ticket.id).await?.current_stage.is_some() {
            graph.resume(&mut ticket, None, &mut context).await
        } else {
            let message = initial_message(&ticket);
            graph.execute(&mut ticket, message, &mut context).await
        };
        self.drive(&mut ticket, result, &token, &mut published).await
    }

    /// Deliver external input to a suspended ticket.
    ///
    /// A delivery id that was already applied is a no-op. Input the ticket is
    /// not waiting for is rejected and leaves the ticket untouched.
    pub async fn resume(
        &self,
        ticket_id: &TicketId,
        input: ExternalInput,
    ) -> Result<OrchestrationResult, WorkflowError> {
        let guard = self.lock_ticket(ticket_id).await;
        let result = self.resume_locked(ticket_id, input).await;
        self.unlock_ticket(ticket_id, guard).await;
        result
    }

    async fn resume_locked(
        &self,
        ticket_id: &TicketId,
        input: ExternalInput,
    ) -> Result<OrchestrationResult, WorkflowError> {
        let mut ticket = self
            .load_ticket(ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::TicketNotFound(ticket_id.to_string()))?;

        if ticket.processed_inputs.contains(&input.id) {
            info!(ticket_id = %ticket_id, input_id = %input.id, "duplicate input ignored");
            self.publish(&ticket.id, EventType::DuplicateInput, [("input_id", input.id)])
                .await;
            return Ok(OrchestrationResult::from_ticket(&ticket));
        }
        if ticket.is_terminal() {
            return Err(WorkflowError::TicketTerminal {
                ticket_id: ticket_id.to_string(),
                state: ticket.state(),
            });
        }

        let token = self.cancellation_token(ticket_id).await;
        let graph = self.graph_for(ticket.phase);
        let mut context = self.context_for(&ticket, &token);
        let mut published = ticket.events().len();
        let input_id = input.id.clone();
        // No longer waiting once the input is handed over; a run that breaks
        // off from here on is reported as interrupted.
        ticket.awaiting = None;
        let result = match graph.resume(&mut ticket, Some(input), &mut context).await {
            Err(e) if e.is_caller_error() => return Err(e),
            other => other,
        };
        if result.is_ok() {
            ticket.processed_inputs.insert(input_id);
        }
        self.drive(&mut ticket, result, &token, &mut published).await
    }

    /// Cancel a ticket. Signals a running graph, waits for it to stop, then
    /// moves the ticket to `Cancelled` and drops its checkpoint.
    pub async fn cancel(
        &self,
        ticket_id: &TicketId,
        reason: &str,
    ) -> Result<OrchestrationResult, WorkflowError> {
        self.cancellation_token(ticket_id).await.cancel();
        let guard = self.lock_ticket(ticket_id).await;
        let result = self.cancel_locked(ticket_id, reason).await;
        self.unlock_ticket(ticket_id, guard).await;
        result
    }

    async fn cancel_locked(
        &self,
        ticket_id: &TicketId,
        reason: &str,
    ) -> Result<OrchestrationResult, WorkflowError> {
        let mut ticket = self
            .load_ticket(ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::TicketNotFound(ticket_id.to_string()))?;
        if ticket.is_terminal() {
            return Ok(OrchestrationResult::from_ticket(&ticket));
        }

        let mut published = ticket.events().len();
        ticket.awaiting = None;
        ticket.transition_to(WorkflowState::Cancelled, reason)?;
        self.collaborators
            .checkpoints
            .delete(&ticket.id, ticket.phase.graph_name())
            .await?;
        self.persist(&ticket, &mut published).await?;
        info!(ticket_id = %ticket_id, reason, "ticket cancelled");
        self.publish(&ticket.id, EventType::TicketCancelled, [("reason", reason.to_string())])
            .await;
        Ok(OrchestrationResult::new(&ticket, OrchestrationOutcome::Cancelled))
    }

    pub async fn status(&self, ticket_id: &TicketId) -> Result<TicketStatus, WorkflowError> {
        let ticket = self
            .load_ticket(ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::TicketNotFound(ticket_id.to_string()))?;
        let graph = self.graph_for(ticket.phase).status(ticket_id).await?;
        Ok(TicketStatus {
            summary: TicketSummary::from_ticket(&ticket),
            graph,
        })
    }

    /// Decide what follows a graph's result, updating the ticket to match.
    pub fn handle_graph_transition(&self, ticket: &mut Ticket, result: GraphExecutionResult) -> GraphTransition {
        match result {
            GraphExecutionResult::Completed { message } => {
                ticket.awaiting = None;
                self.chain(ticket, message)
            }
            GraphExecutionResult::Suspended { awaiting, .. } => {
                ticket.awaiting = Some(awaiting);
                GraphTransition::Finish(OrchestrationOutcome::Suspended { awaiting })
            }
            GraphExecutionResult::Failed {
                stage,
                error: WorkflowError::Cancelled,
            } => {
                ticket.awaiting = None;
                if let Err(e) = ticket.transition_to(WorkflowState::Cancelled, format!("cancelled during {stage}")) {
                    error!(ticket_id = %ticket.id, error = %e, "could not record cancellation");
                }
                GraphTransition::Finish(OrchestrationOutcome::Cancelled)
            }
            GraphExecutionResult::Failed { stage, error } => self.fail(ticket, stage, &error),
        }
    }

    fn chain(&self, ticket: &mut Ticket, message: WorkflowMessage) -> GraphTransition {
        match message {
            WorkflowMessage::RefinementComplete { .. } if ticket.phase == Phase::Refinement => {
                self.advance(ticket, Phase::Planning, message)
            }
            WorkflowMessage::PlanApproved { .. } if ticket.phase == Phase::Planning => {
                if self.settings.tenant(&ticket.tenant_id).skip_implementation {
                    self.complete(ticket, "plan approved, implementation skipped for tenant")
                } else {
                    self.advance(ticket, Phase::Implementation, message)
                }
            }
            WorkflowMessage::ImplementationComplete { ref pull_request_url }
                if ticket.phase == Phase::Implementation =>
            {
                let reason = format!("pull request opened: {pull_request_url}");
                self.complete(ticket, &reason)
            }
            WorkflowMessage::RefinementComplete { .. }
            | WorkflowMessage::PlanApproved { .. }
            | WorkflowMessage::ImplementationComplete { .. }
            | WorkflowMessage::TicketTriggered { .. }
            | WorkflowMessage::QuestionsRequired { .. }
            | WorkflowMessage::QuestionsPosted { .. }
            | WorkflowMessage::AnswersProvided { .. }
            | WorkflowMessage::AnalysisComplete { .. }
            | WorkflowMessage::TicketUpdateDrafted { .. }
            | WorkflowMessage::TicketUpdatePosted { .. }
            | WorkflowMessage::TicketUpdateApproved { .. }
            | WorkflowMessage::TicketUpdateRejected { .. }
            | WorkflowMessage::RevisionRequested { .. }
            | WorkflowMessage::PlanGenerated { .. }
            | WorkflowMessage::PlanCommitted { .. }
            | WorkflowMessage::PlanSummaryPosted { .. }
            | WorkflowMessage::BranchesJoined { .. }
            | WorkflowMessage::PlanRejected { .. }
            | WorkflowMessage::ImplementationReady { .. }
            | WorkflowMessage::PullRequestOpened { .. } => {
                let error = WorkflowError::UnexpectedMessage {
                    stage: format!("{} completion", ticket.phase),
                    message: message.kind().to_string(),
                };
                self.fail(ticket, "chaining".to_string(), &error)
            }
        }
    }

    fn advance(&self, ticket: &mut Ticket, phase: Phase, message: WorkflowMessage) -> GraphTransition {
        info!(ticket_id = %ticket.id, from = %ticket.phase, to = %phase, "chaining to next phase");
        ticket.phase = phase;
        ticket.phase_input = Some(message.clone());
        GraphTransition::Chain { phase, message }
    }

    fn complete(&self, ticket: &mut Ticket, reason: &str) -> GraphTransition {
        match ticket.transition_to(WorkflowState::Completed, reason) {
            Ok(()) => GraphTransition::Finish(OrchestrationOutcome::Completed),
            Err(e) => self.fail(ticket, "chaining".to_string(), &e),
        }
    }

    fn fail(&self, ticket: &mut Ticket, stage: String, error: &WorkflowError) -> GraphTransition {
        let reason = error.to_string();
        warn!(ticket_id = %ticket.id, phase = %ticket.phase, stage = %stage, %reason, "ticket failed");
        ticket.awaiting = None;
        ticket.failure = Some(FailureInfo {
            phase: ticket.phase,
            stage: stage.clone(),
            reason: reason.clone(),
            at: chrono::Utc::now(),
        });
        if let Err(e) = ticket.transition_to(WorkflowState::Failed, reason.clone()) {
            error!(ticket_id = %ticket.id, error = %e, "could not record failure");
        }
        GraphTransition::Finish(OrchestrationOutcome::Failed { stage, reason })
    }

    /// Follow graph results until the ticket suspends or ends, persisting
    /// the ticket after every graph.
    async fn drive(
        &self,
        ticket: &mut Ticket,
        mut result: Result<GraphExecutionResult, WorkflowError>,
        token: &CancellationToken,
        published: &mut usize,
    ) -> Result<OrchestrationResult, WorkflowError> {
        loop {
            let graph_result = match result {
                Ok(graph_result) => graph_result,
                Err(e) => {
                    // Keep whatever progress was made before the store failed;
                    // with `awaiting` cleared the ticket reads as interrupted.
                    ticket.awaiting = None;
                    if let Err(save_error) = self.persist(ticket, published).await {
                        error!(ticket_id = %ticket.id, error = %save_error, "could not persist ticket");
                    }
                    return Err(e);
                }
            };

            match self.handle_graph_transition(ticket, graph_result) {
                GraphTransition::Chain { phase, message } => {
                    self.persist(ticket, published).await?;
                    self.publish(
                        &ticket.id,
                        EventType::PhaseChained,
                        [("phase", phase.to_string()), ("message", message.kind().to_string())],
                    )
                    .await;
                    let graph = self.graph_for(phase);
                    let mut context = self.context_for(ticket, token);
                    result = graph.execute(ticket, message, &mut context).await;
                }
                GraphTransition::Finish(outcome) => {
                    if outcome == OrchestrationOutcome::Cancelled {
                        self.collaborators
                            .checkpoints
                            .delete(&ticket.id, ticket.phase.graph_name())
                            .await?;
                    }
                    self.persist(ticket, published).await?;
                    self.publish_outcome(ticket, &outcome).await;
                    return Ok(OrchestrationResult::new(ticket, outcome));
                }
            }
        }
    }

    async fn publish_outcome(&self, ticket: &Ticket, outcome: &OrchestrationOutcome) {
        match outcome {
            OrchestrationOutcome::Completed => {
                info!(ticket_id = %ticket.id, "ticket completed");
                self.publish(&ticket.id, EventType::TicketCompleted, [("phase", ticket.phase.to_string())])
                    .await;
            }
            OrchestrationOutcome::Failed { stage, reason } => {
                self.publish(
                    &ticket.id,
                    EventType::TicketFailed,
                    [("stage", stage.clone()), ("reason", reason.clone())],
                )
                .await;
            }
            OrchestrationOutcome::Cancelled => {
                self.publish(&ticket.id, EventType::TicketCancelled, [("phase", ticket.phase.to_string())])
                    .await;
            }
            OrchestrationOutcome::Suspended { .. } | OrchestrationOutcome::Interrupted => {}
        }
    }

    /// Save the ticket, then announce the transitions made since the last save.
    async fn persist(&self, ticket: &Ticket, published: &mut usize) -> Result<(), WorkflowError> {
        self.collaborators.tickets.save(ticket).await?;
        for event in ticket.events().iter().skip(*published) {
            self.publish(
                &ticket.id,
                EventType::StateChanged,
                [
                    ("from", event.from.to_string()),
                    ("to", event.to.to_string()),
                    ("reason", event.reason.clone()),
                ],
            )
            .await;
        }
        *published = ticket.events().len();
        Ok(())
    }

    async fn load_ticket(&self, ticket_id: &TicketId) -> Result<Option<Ticket>, WorkflowError> {
        let ticket = self.collaborators.tickets.load(ticket_id).await?;
        if let Some(ticket) = &ticket {
            StateMachine::validate_history(ticket)?;
        }
        Ok(ticket)
    }

    fn graph_for(&self, phase: Phase) -> Graph {
        Graph::new(
            graph::definition_for(phase),
            self.collaborators.executor.clone(),
            self.collaborators.checkpoints.clone(),
            self.collaborators.events.clone(),
            self.settings.graph.clone(),
        )
    }

    fn context_for(&self, ticket: &Ticket, token: &CancellationToken) -> AgentContext {
        AgentContext::new(ticket.id.clone(), ticket.tenant_id.clone())
            .with_settings(self.settings.tenant(&ticket.tenant_id))
            .with_cancellation(token.clone())
    }

    async fn lock_ticket(&self, ticket_id: &TicketId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(ticket_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Release a ticket lock, dropping the run's cancellation token and the
    /// lock itself once nobody else holds or waits on it.
    async fn unlock_ticket(&self, ticket_id: &TicketId, guard: OwnedMutexGuard<()>) {
        self.cancellations.lock().await.remove(ticket_id);
        drop(guard);
        let mut locks = self.locks.lock().await;
        if locks
            .get(ticket_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(ticket_id);
        }
    }

    async fn cancellation_token(&self, ticket_id: &TicketId) -> CancellationToken {
        self.cancellations
            .lock()
            .await
            .entry(ticket_id.clone())
            .or_default()
            .clone()
    }

    async fn publish<const N: usize>(&self, ticket_id: &TicketId, event: EventType, fields: [(&str, String); N]) {
        let metadata: Metadata = fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        publish_quietly(self.collaborators.events.as_ref(), ticket_id, event, metadata).await;
    }
}

/// Message the current phase's graph starts from.
fn initial_message(ticket: &Ticket) -> WorkflowMessage {
    ticket
        .phase_input
        .clone()
        .unwrap_or_else(|| WorkflowMessage::TicketTriggered {
            ticket_id: ticket.id.clone(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use super::*;
    use crate::error::StepFailure;
    use crate::graph::testing::ScriptedExecutor;
    use crate::ports::{MemoryCheckpointStore, MemoryTicketRepository, RecordingEventPublisher};

    /// In-memory checkpoints whose n-th save from now can be made to fail.
    #[derive(Default)]
    struct UnreliableCheckpoints {
        inner: MemoryCheckpointStore,
        fail_at: AtomicUsize,
    }

    impl UnreliableCheckpoints {
        fn fail_save(&self, nth: usize) {
            self.fail_at.store(nth, Ordering::SeqCst);
        }

        async fn is_empty(&self) -> bool {
            self.inner.is_empty().await
        }
    }

    #[async_trait]
    impl CheckpointStore for UnreliableCheckpoints {
        async fn save(
            &self,
            ticket_id: &TicketId,
            graph: &str,
            stage: &str,
            payload: Vec<u8>,
        ) -> Result<(), WorkflowError> {
            let remaining = self.fail_at.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_at.store(remaining - 1, Ordering::SeqCst);
                if remaining == 1 {
                    return Err(WorkflowError::Store("disk full".into()));
                }
            }
            self.inner.save(ticket_id, graph, stage, payload).await
        }

        async fn load(
            &self,
            ticket_id: &TicketId,
            graph: &str,
        ) -> Result<Option<crate::ports::Checkpoint>, WorkflowError> {
            self.inner.load(ticket_id, graph).await
        }

        async fn delete(&self, ticket_id: &TicketId, graph: &str) -> Result<(), WorkflowError> {
            self.inner.delete(ticket_id, graph).await
        }
    }

    struct Harness {
        orchestrator: Arc<WorkflowOrchestrator>,
        executor: Arc<ScriptedExecutor>,
        tickets: Arc<MemoryTicketRepository>,
        checkpoints: Arc<UnreliableCheckpoints>,
        events: Arc<RecordingEventPublisher>,
    }

    fn harness_with(tenants: &[(&str, TenantSettings)]) -> Harness {
        let executor = Arc::new(ScriptedExecutor::new());
        let tickets = Arc::new(MemoryTicketRepository::new());
        let checkpoints = Arc::new(UnreliableCheckpoints::default());
        let events = Arc::new(RecordingEventPublisher::new());
        let settings = OrchestratorSettings {
            graph: GraphSettings::default(),
            tenants: tenants
                .iter()
                .map(|(id, settings)| (id.to_string(), settings.clone()))
                .collect(),
        };
        let orchestrator = WorkflowOrchestrator::new(
            Collaborators {
                tickets: tickets.clone(),
                checkpoints: checkpoints.clone(),
                events: events.clone(),
                executor: executor.clone(),
            },
            settings,
        );
        Harness {
            orchestrator: Arc::new(orchestrator),
            executor,
            tickets,
            checkpoints,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(&[])
    }

    fn acme() -> TenantId {
        TenantId::from("acme")
    }

    fn t1() -> TicketId {
        TicketId::from("T-1")
    }

    fn approve(id: &str) -> ExternalInput {
        ExternalInput::new(
            id,
            WorkflowMessage::PlanApproved {
                plan: String::new(),
                approved_by: Some("lead".into()),
            },
        )
    }

    fn reject(id: &str) -> ExternalInput {
        ExternalInput::new(
            id,
            WorkflowMessage::PlanRejected {
                feedback: "needs a rollback section".into(),
            },
        )
    }

    #[tokio::test]
    async fn start_chains_refinement_into_planning() {
        let h = harness();
        let result = h.orchestrator.start(&acme(), &t1()).await.unwrap();

        assert_eq!(result.phase, Phase::Planning);
        assert_eq!(result.state, WorkflowState::PlanUnderReview);
        assert_eq!(
            result.outcome,
            OrchestrationOutcome::Suspended {
                awaiting: AwaitingInput::PlanReview
            }
        );

        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert_eq!(stored.state(), WorkflowState::PlanUnderReview);
        assert_eq!(stored.awaiting, Some(AwaitingInput::PlanReview));
        assert_eq!(h.events.of_type(EventType::PhaseChained).await.len(), 1);
        assert_eq!(
            h.events.of_type(EventType::StateChanged).await.len(),
            stored.events().len()
        );
    }

    #[tokio::test]
    async fn approval_runs_implementation_to_completion() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let result = h.orchestrator.resume(&t1(), approve("d-1")).await.unwrap();

        assert_eq!(result.outcome, OrchestrationOutcome::Completed);
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.phase, Phase::Implementation);
        assert!(h.checkpoints.is_empty().await);

        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert!(stored.awaiting.is_none());
        assert!(stored.processed_inputs.contains("d-1"));
        StateMachine::validate_history(&stored).unwrap();
        assert_eq!(h.events.of_type(EventType::TicketCompleted).await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_can_skip_implementation() {
        let h = harness_with(&[(
            "acme",
            TenantSettings {
                skip_implementation: true,
                ..TenantSettings::default()
            },
        )]);
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let result = h.orchestrator.resume(&t1(), approve("d-1")).await.unwrap();

        assert_eq!(result.outcome, OrchestrationOutcome::Completed);
        assert_eq!(result.phase, Phase::Planning);
        assert_eq!(h.executor.calls_to("code_implementer"), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_advance() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let first = h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap();
        let generator_calls = h.executor.calls_to("plan_generator");

        let second = h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.executor.calls_to("plan_generator"), generator_calls);
        assert_eq!(h.events.of_type(EventType::DuplicateInput).await.len(), 1);
    }

    #[tokio::test]
    async fn wrong_input_is_rejected_without_changes() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let before = h.tickets.load(&t1()).await.unwrap().unwrap();

        let err = h
            .orchestrator
            .resume(
                &t1(),
                ExternalInput::new(
                    "d-1",
                    WorkflowMessage::AnswersProvided {
                        answers: vec!["?".into()],
                    },
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::InputNotAccepted { .. }));
        let after = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert_eq!(after.events(), before.events());
        assert!(!after.processed_inputs.contains("d-1"));
    }

    #[tokio::test]
    async fn resume_unknown_ticket_is_not_found() {
        let h = harness();
        let err = h.orchestrator.resume(&t1(), approve("d-1")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::TicketNotFound(_)));
    }

    #[tokio::test]
    async fn resume_completed_ticket_is_refused() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        h.orchestrator.resume(&t1(), approve("d-1")).await.unwrap();

        let err = h.orchestrator.resume(&t1(), approve("d-2")).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::TicketTerminal {
                state: WorkflowState::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn step_failure_fails_ticket_and_keeps_checkpoint() {
        let h = harness();
        h.executor.script(
            "plan_committer",
            Err(StepFailure::Permanent("repository archived".into())),
        );
        let result = h.orchestrator.start(&acme(), &t1()).await.unwrap();

        match &result.outcome {
            OrchestrationOutcome::Failed { stage, reason } => {
                assert_eq!(stage, graph::planning::PUBLISH);
                assert!(reason.contains("repository archived"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(result.state, WorkflowState::Failed);
        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        let failure = stored.failure.unwrap();
        assert_eq!(failure.phase, Phase::Planning);
        assert!(!h.checkpoints.is_empty().await);
        assert_eq!(h.events.of_type(EventType::TicketFailed).await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_suspended_ticket() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();

        let result = h.orchestrator.cancel(&t1(), "duplicate of T-0").await.unwrap();
        assert_eq!(result.outcome, OrchestrationOutcome::Cancelled);
        assert_eq!(result.state, WorkflowState::Cancelled);
        assert!(h.checkpoints.is_empty().await);

        // Cancelling again reports the terminal state.
        let again = h.orchestrator.cancel(&t1(), "again").await.unwrap();
        assert_eq!(again.outcome, OrchestrationOutcome::Cancelled);
        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert_eq!(
            stored.events().iter().filter(|e| e.to == WorkflowState::Cancelled).count(),
            1
        );
    }

    #[tokio::test]
    async fn status_reports_summary_and_graph_position() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();

        let status = h.orchestrator.status(&t1()).await.unwrap();
        assert_eq!(status.summary.state, WorkflowState::PlanUnderReview);
        assert_eq!(status.graph.graph, "planning");
        assert_eq!(status.graph.current_stage.as_deref(), Some(graph::planning::AWAIT_REVIEW));
        assert!(status.graph.is_suspended);
    }

    #[tokio::test]
    async fn start_twice_reports_suspension() {
        let h = harness();
        let first = h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let second = h.orchestrator.start(&acme(), &t1()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.executor.calls_to("ticket_analyzer"), 1);
    }

    #[tokio::test]
    async fn start_with_other_tenant_is_refused() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        let err = h
            .orchestrator
            .start(&TenantId::from("globex"), &t1())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn input_lost_to_a_store_failure_can_be_redelivered() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        h.checkpoints.fail_save(1);

        let err = h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert!(!stored.processed_inputs.contains("d-1"));
        assert!(stored.awaiting.is_none());
        assert_eq!(
            OrchestrationResult::from_ticket(&stored).outcome,
            OrchestrationOutcome::Interrupted
        );

        let generator_calls = h.executor.calls_to("plan_generator");
        let result = h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap();
        assert_eq!(
            result.outcome,
            OrchestrationOutcome::Suspended {
                awaiting: AwaitingInput::PlanReview
            }
        );
        assert_eq!(result.state, WorkflowState::PlanUnderReview);
        assert_eq!(h.executor.calls_to("plan_generator"), generator_calls + 1);

        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        assert!(stored.processed_inputs.contains("d-1"));
        assert_eq!(stored.awaiting, Some(AwaitingInput::PlanReview));
        StateMachine::validate_history(&stored).unwrap();
    }

    #[tokio::test]
    async fn start_continues_interrupted_run_without_repeating_effects() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        // The in-flight save after publishing succeeds; the suspend save fails.
        h.checkpoints.fail_save(2);
        h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap_err();

        let status = h.orchestrator.status(&t1()).await.unwrap();
        assert_eq!(status.graph.current_stage.as_deref(), Some(graph::planning::PUBLISH));
        assert!(!status.graph.is_suspended);
        assert_eq!(h.executor.calls_to("plan_committer"), 2);
        assert_eq!(h.executor.calls_to("plan_summary_poster"), 2);

        let result = h.orchestrator.start(&acme(), &t1()).await.unwrap();
        assert_eq!(
            result.outcome,
            OrchestrationOutcome::Suspended {
                awaiting: AwaitingInput::PlanReview
            }
        );
        assert_eq!(result.state, WorkflowState::PlanUnderReview);
        assert_eq!(h.executor.calls_to("plan_generator"), 2);
        assert_eq!(h.executor.calls_to("plan_committer"), 2);
        assert_eq!(h.executor.calls_to("plan_summary_poster"), 2);

        // The rejection was applied by the interrupted run.
        h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap();
        assert_eq!(h.executor.calls_to("plan_generator"), 2);
        let stored = h.tickets.load(&t1()).await.unwrap().unwrap();
        StateMachine::validate_history(&stored).unwrap();
    }

    #[tokio::test]
    async fn redelivery_continues_interrupted_run() {
        let h = harness();
        h.orchestrator.start(&acme(), &t1()).await.unwrap();
        h.checkpoints.fail_save(2);
        h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap_err();

        let result = h.orchestrator.resume(&t1(), reject("d-1")).await.unwrap();
        assert_eq!(result.state, WorkflowState::PlanUnderReview);
        assert_eq!(h.executor.calls_to("plan_generator"), 2);
        assert_eq!(h.executor.calls_to("plan_committer"), 2);

        let status = h.orchestrator.status(&t1()).await.unwrap();
        assert!(status.graph.is_suspended);
    }

    #[tokio::test]
    async fn finished_calls_release_ticket_locks_and_tokens() {
        let h = harness();
        for n in 0..4 {
            h.orchestrator
                .start(&acme(), &TicketId::new(format!("T-{n}")))
                .await
                .unwrap();
        }
        h.orchestrator.resume(&TicketId::from("T-0"), approve("d-1")).await.unwrap();
        h.orchestrator.cancel(&TicketId::from("T-1"), "not needed").await.unwrap();
        h.executor.script(
            "plan_committer",
            Err(StepFailure::Permanent("repository archived".into())),
        );
        let failed = h.orchestrator.start(&acme(), &TicketId::from("T-9")).await.unwrap();
        assert!(matches!(failed.outcome, OrchestrationOutcome::Failed { .. }));
        h.orchestrator.resume(&t1(), approve("d-2")).await.unwrap_err();

        assert!(h.orchestrator.locks.lock().await.is_empty());
        assert!(h.orchestrator.cancellations.lock().await.is_empty());
    }

    #[test]
    fn unexpected_completion_message_fails_ticket() {
        let h = harness();
        let mut ticket = Ticket::new(t1(), acme());
        ticket.transition_to(WorkflowState::Analyzing, "start").unwrap();

        let transition = h.orchestrator.handle_graph_transition(
            &mut ticket,
            GraphExecutionResult::Completed {
                message: WorkflowMessage::PlanGenerated { plan: "p".into() },
            },
        );

        assert!(matches!(
            transition,
            GraphTransition::Finish(OrchestrationOutcome::Failed { .. })
        ));
        assert_eq!(ticket.state(), WorkflowState::Failed);
        assert!(ticket.failure.unwrap().reason.contains("plan_generated"));
    }

    #[test]
    fn planning_completion_from_wrong_phase_fails_ticket() {
        let h = harness();
        let mut ticket = Ticket::new(t1(), acme());
        ticket.transition_to(WorkflowState::Analyzing, "start").unwrap();

        let transition = h.orchestrator.handle_graph_transition(
            &mut ticket,
            GraphExecutionResult::Completed {
                message: WorkflowMessage::PlanApproved {
                    plan: "p".into(),
                    approved_by: None,
                },
            },
        );
        assert!(matches!(
            transition,
            GraphTransition::Finish(OrchestrationOutcome::Failed { .. })
        ));
    }

    /// Blocks inside `plan_generator` until released, so a cancel can race it.
    struct BlockingExecutor {
        inner: ScriptedExecutor,
        entered: Notify,
        release: Notify,
        blocked: AtomicBool,
    }

    #[async_trait]
    impl AgentExecutor for BlockingExecutor {
        async fn execute(
            &self,
            step: &str,
            input: &WorkflowMessage,
            context: &AgentContext,
            deadline: Instant,
        ) -> Result<WorkflowMessage, StepFailure> {
            if step == "plan_generator" && !self.blocked.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.execute(step, input, context, deadline).await
        }
    }

    #[tokio::test]
    async fn cancel_waits_for_running_graph() {
        let executor = Arc::new(BlockingExecutor {
            inner: ScriptedExecutor::new(),
            entered: Notify::new(),
            release: Notify::new(),
            blocked: AtomicBool::new(false),
        });
        let tickets = Arc::new(MemoryTicketRepository::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Collaborators {
                tickets: tickets.clone(),
                checkpoints: checkpoints.clone(),
                events: Arc::new(RecordingEventPublisher::new()),
                executor: executor.clone(),
            },
            OrchestratorSettings::default(),
        ));

        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.start(&acme(), &t1()).await })
        };
        executor.entered.notified().await;

        let canceller = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.cancel(&t1(), "superseded").await })
        };
        // Give the cancel call time to signal before the step returns.
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.release.notify_one();

        let run = runner.await.unwrap().unwrap();
        assert_eq!(run.outcome, OrchestrationOutcome::Cancelled);
        let cancel = canceller.await.unwrap().unwrap();
        assert_eq!(cancel.state, WorkflowState::Cancelled);

        assert!(checkpoints.is_empty().await);
        assert_eq!(executor.inner.calls_to("plan_committer"), 0);
        let stored = tickets.load(&t1()).await.unwrap().unwrap();
        StateMachine::validate_history(&stored).unwrap();
    }
}
