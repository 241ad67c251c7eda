use std::fmt;

use serde::{Deserialize, Serialize};

use super::ticket::{Ticket, WorkflowEvent};
use crate::error::WorkflowError;

/// The seventeen states a ticket moves through.
///
/// Tickets start at `Triggered` and finish at `Completed`, `Cancelled` or
/// `Failed`. Declaration order follows the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowState {
    Triggered,
    Analyzing,
    QuestionsPosted,
    AwaitingAnswers,
    AnswersReceived,
    RefiningTicket,
    TicketUpdateUnderReview,
    TicketUpdateApproved,
    TicketUpdateRejected,
    Planning,
    PlanUnderReview,
    PlanApproved,
    PlanRejected,
    Implementing,
    Completed,
    Cancelled,
    Failed,
}

/// Coarse grouping of states, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatePartition {
    Entry,
    Working,
    WaitingForHuman,
    Decision,
    Terminal,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 17] = [
        WorkflowState::Triggered,
        WorkflowState::Analyzing,
        WorkflowState::QuestionsPosted,
        WorkflowState::AwaitingAnswers,
        WorkflowState::AnswersReceived,
        WorkflowState::RefiningTicket,
        WorkflowState::TicketUpdateUnderReview,
        WorkflowState::TicketUpdateApproved,
        WorkflowState::TicketUpdateRejected,
        WorkflowState::Planning,
        WorkflowState::PlanUnderReview,
        WorkflowState::PlanApproved,
        WorkflowState::PlanRejected,
        WorkflowState::Implementing,
        WorkflowState::Completed,
        WorkflowState::Cancelled,
        WorkflowState::Failed,
    ];

    pub fn partition(self) -> StatePartition {
        use WorkflowState::*;
        match self {
            Triggered => StatePartition::Entry,
            Analyzing | AnswersReceived | RefiningTicket | Planning | Implementing => {
                StatePartition::Working
            }
            QuestionsPosted | AwaitingAnswers | TicketUpdateUnderReview | PlanUnderReview => {
                StatePartition::WaitingForHuman
            }
            TicketUpdateApproved | TicketUpdateRejected | PlanApproved | PlanRejected => {
                StatePartition::Decision
            }
            Completed | Cancelled | Failed => StatePartition::Terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.partition() == StatePartition::Terminal
    }

    pub fn is_waiting(self) -> bool {
        self.partition() == StatePartition::WaitingForHuman
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Triggered => "TRIGGERED",
            WorkflowState::Analyzing => "ANALYZING",
            WorkflowState::QuestionsPosted => "QUESTIONS_POSTED",
            WorkflowState::AwaitingAnswers => "AWAITING_ANSWERS",
            WorkflowState::AnswersReceived => "ANSWERS_RECEIVED",
            WorkflowState::RefiningTicket => "REFINING_TICKET",
            WorkflowState::TicketUpdateUnderReview => "TICKET_UPDATE_UNDER_REVIEW",
            WorkflowState::TicketUpdateApproved => "TICKET_UPDATE_APPROVED",
            WorkflowState::TicketUpdateRejected => "TICKET_UPDATE_REJECTED",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::PlanUnderReview => "PLAN_UNDER_REVIEW",
            WorkflowState::PlanApproved => "PLAN_APPROVED",
            WorkflowState::PlanRejected => "PLAN_REJECTED",
            WorkflowState::Implementing => "IMPLEMENTING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Cancelled => "CANCELLED",
            WorkflowState::Failed => "FAILED",
        };
        f.pad(name)
    }
}

/// Owns the transition table. Every legality check in the crate goes
/// through here, including [`Ticket::transition_to`].
pub struct StateMachine;

impl StateMachine {
    /// The states reachable in one step from `state`.
    ///
    /// ```text
    /// Triggered               -> Analyzing
    /// Analyzing               -> QuestionsPosted | RefiningTicket
    /// QuestionsPosted         -> AwaitingAnswers
    /// AwaitingAnswers         -> AnswersReceived
    /// AnswersReceived         -> Analyzing | RefiningTicket
    /// RefiningTicket          -> TicketUpdateUnderReview | TicketUpdateApproved
    /// TicketUpdateUnderReview -> TicketUpdateApproved | TicketUpdateRejected
    /// TicketUpdateRejected    -> RefiningTicket
    /// TicketUpdateApproved    -> Planning
    /// Planning                -> PlanUnderReview
    /// PlanUnderReview         -> PlanApproved | PlanRejected
    /// PlanRejected            -> Planning
    /// PlanApproved            -> Implementing | Completed
    /// Implementing            -> Completed
    /// ```
    ///
    /// Every non-terminal state may also move to `Cancelled` or `Failed`.
    /// Terminal states have no successors.
    pub fn valid_transitions(state: WorkflowState) -> Vec<WorkflowState> {
        use WorkflowState::*;

        let forward: &[WorkflowState] = match state {
            Triggered => &[Analyzing],
            Analyzing => &[QuestionsPosted, RefiningTicket],
            QuestionsPosted => &[AwaitingAnswers],
            AwaitingAnswers => &[AnswersReceived],
            AnswersReceived => &[Analyzing, RefiningTicket],
            RefiningTicket => &[TicketUpdateUnderReview, TicketUpdateApproved],
            TicketUpdateUnderReview => &[TicketUpdateApproved, TicketUpdateRejected],
            TicketUpdateRejected => &[RefiningTicket],
            TicketUpdateApproved => &[Planning],
            Planning => &[PlanUnderReview],
            PlanUnderReview => &[PlanApproved, PlanRejected],
            PlanRejected => &[Planning],
            PlanApproved => &[Implementing, Completed],
            Implementing => &[Completed],
            Completed | Cancelled | Failed => return Vec::new(),
        };

        let mut next = forward.to_vec();
        next.extend([Cancelled, Failed]);
        next
    }

    pub fn can_transition(from: WorkflowState, to: WorkflowState) -> bool {
        Self::valid_transitions(from).contains(&to)
    }

    /// Validate and apply a transition, appending exactly one event.
    ///
    /// On error the ticket is left untouched.
    pub fn transition(
        ticket: &mut Ticket,
        to: WorkflowState,
        reason: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let from = ticket.state;
        if !Self::can_transition(from, to) {
            return Err(WorkflowError::InvalidTransition { from, to });
        }

        let event = WorkflowEvent::new(from, to, reason);
        tracing::debug!(ticket_id = %ticket.id, %from, %to, reason = %event.reason, "state transition");
        ticket.state = to;
        ticket.updated_at = event.at;
        ticket.events.push(event);
        Ok(())
    }

    /// Replay a ticket's event log from `Triggered` and check that every
    /// step is legal and that the log ends at the ticket's current state.
    pub fn validate_history(ticket: &Ticket) -> Result<(), WorkflowError> {
        let corrupt = |reason: String| WorkflowError::CorruptHistory {
            ticket_id: ticket.id.to_string(),
            reason,
        };

        let mut current = WorkflowState::Triggered;
        for (index, event) in ticket.events.iter().enumerate() {
            if event.from != current {
                return Err(corrupt(format!(
                    "event {index} starts at {} but ticket was {current}",
                    event.from
                )));
            }
            if !Self::can_transition(event.from, event.to) {
                return Err(corrupt(format!(
                    "event {index} is illegal: {} -> {}",
                    event.from, event.to
                )));
            }
            current = event.to;
        }

        if current != ticket.state {
            return Err(corrupt(format!(
                "history ends at {current} but ticket is {}",
                ticket.state
            )));
        }
        Ok(())
    }
}
