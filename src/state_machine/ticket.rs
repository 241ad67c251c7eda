use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{StateMachine, WorkflowState};
use crate::error::WorkflowError;
use crate::message::{AwaitingInput, WorkflowMessage};

/// Tracker-side identifier of a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant owning a ticket. Threaded explicitly through every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The graph a ticket is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refinement,
    Planning,
    Implementation,
}

impl Phase {
    /// Name used as the checkpoint key for this phase's graph.
    pub fn graph_name(self) -> &'static str {
        match self {
            Phase::Refinement => "refinement",
            Phase::Planning => "planning",
            Phase::Implementation => "implementation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.graph_name())
    }
}

/// One validated state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl WorkflowEvent {
    pub(crate) fn new(from: WorkflowState, to: WorkflowState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Why and where a ticket failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub phase: Phase,
    pub stage: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A ticket moving through refinement, planning and implementation.
///
/// `state` is only ever changed through [`Ticket::transition_to`] (or the
/// [`StateMachine`] it delegates to), so `events` always replays to it.
/// Both are read through accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub tenant_id: TenantId,
    pub(super) state: WorkflowState,
    pub phase: Phase,
    pub(super) events: Vec<WorkflowEvent>,
    /// External input the ticket is suspended on, if any.
    pub awaiting: Option<AwaitingInput>,
    pub failure: Option<FailureInfo>,
    /// Message the current phase's graph was started with.
    #[serde(default)]
    pub phase_input: Option<WorkflowMessage>,
    /// Delivery ids of external inputs already applied.
    #[serde(default)]
    pub processed_inputs: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(id: TicketId, tenant_id: TenantId) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id,
            state: WorkflowState::Triggered,
            phase: Phase::Refinement,
            events: Vec::new(),
            awaiting: None,
            failure: None,
            phase_input: None,
            processed_inputs: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Every transition applied so far, oldest first.
    pub fn events(&self) -> &[WorkflowEvent] {
        &self.events
    }

    pub fn transition_to(
        &mut self,
        to: WorkflowState,
        reason: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        StateMachine::transition(self, to, reason)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Read-only view of a ticket for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_id: TicketId,
    pub tenant_id: TenantId,
    pub state: WorkflowState,
    pub phase: Phase,
    pub awaiting: Option<AwaitingInput>,
    pub failure: Option<FailureInfo>,
    pub state_transitions: Vec<WorkflowState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TicketSummary {
    pub fn from_ticket(ticket: &Ticket) -> Self {
        let mut transitions = vec![WorkflowState::Triggered];
        transitions.extend(ticket.events.iter().map(|event| event.to));

        Self {
            ticket_id: ticket.id.clone(),
            tenant_id: ticket.tenant_id.clone(),
            state: ticket.state,
            phase: ticket.phase,
            awaiting: ticket.awaiting,
            failure: ticket.failure.clone(),
            state_transitions: transitions,
            started_at: ticket.created_at,
            updated_at: ticket.updated_at,
            duration_ms: (ticket.updated_at - ticket.created_at).num_milliseconds(),
        }
    }
}
