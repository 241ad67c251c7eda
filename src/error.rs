use thiserror::Error;

use crate::state_machine::WorkflowState;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("No checkpoint found for ticket {ticket_id} in graph {graph}")]
    NoCheckpointFound { ticket_id: String, graph: String },

    #[error("Step {step} failed after {attempts} attempts: {reason}")]
    StepTransientFailure {
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("Step {step} failed: {reason}")]
    StepPermanentFailure { step: String, reason: String },

    #[error("Max retries exceeded for {revision}: {max} revisions allowed")]
    MaxRetriesExceeded { revision: String, max: u32 },

    #[error("Parallel stage {stage} failed: {}", .failures.join("; "))]
    BranchesFailed { stage: String, failures: Vec<String> },

    #[error("Stage {stage} cannot handle message {message}")]
    UnexpectedMessage { stage: String, message: String },

    #[error("Ticket {ticket_id} is waiting for {awaiting}, got {message}")]
    InputNotAccepted {
        ticket_id: String,
        awaiting: String,
        message: String,
    },

    #[error("Stage {0} is not defined")]
    UnknownStage(String),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Ticket not found: {0}")]
    TicketNotFound(String),

    #[error("Ticket {ticket_id} already reached terminal state {state}")]
    TicketTerminal {
        ticket_id: String,
        state: WorkflowState,
    },

    #[error("Ticket {ticket_id} belongs to tenant {expected}, not {actual}")]
    TenantMismatch {
        ticket_id: String,
        expected: String,
        actual: String,
    },

    #[error("Ticket {ticket_id} has corrupt history: {reason}")]
    CorruptHistory { ticket_id: String, reason: String },

    #[error("Identifier {0:?} cannot be used as a storage key")]
    InvalidKey(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Errors caused by the caller (bad request, stale input) rather than by
    /// the workflow itself. They never move a ticket to `Failed`.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            WorkflowError::NoCheckpointFound { .. }
                | WorkflowError::InputNotAccepted { .. }
                | WorkflowError::TicketNotFound(_)
                | WorkflowError::TicketTerminal { .. }
                | WorkflowError::TenantMismatch { .. }
                | WorkflowError::InvalidKey(_)
        )
    }

    /// Terminal errors end the ticket; nothing retries them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowError::Store(_) | WorkflowError::Io(_))
    }
}

/// Outcome classification reported by an agent step.
///
/// Transient failures are retried with backoff inside the step boundary;
/// permanent failures surface immediately.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Error)]
pub enum StepFailure {
    /// Infrastructure failure (timeout, rate limit, network error).
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Logic or validation failure (bad output, rejected input).
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl StepFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepFailure::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            StepFailure::Transient(reason) | StepFailure::Permanent(reason) => reason,
        }
    }
}
