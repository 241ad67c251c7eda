//! Messages flowing between steps, between graphs, and in from humans.
//!
//! [`WorkflowMessage`] is a closed sum type: the orchestrator's chaining
//! rules and every graph's routing match on it exhaustively.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state_machine::TicketId;

/// Output of one parallel branch, kept in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOutput {
    pub step: String,
    pub message: WorkflowMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowMessage {
    /// Initial message of the refinement graph.
    TicketTriggered { ticket_id: TicketId },
    QuestionsRequired { questions: Vec<String> },
    QuestionsPosted { questions: Vec<String> },
    /// Human input: answers to the posted questions.
    AnswersProvided { answers: Vec<String> },
    AnalysisComplete { summary: String },
    TicketUpdateDrafted { update: String },
    TicketUpdatePosted { update: String },
    /// Human input: the proposed ticket update is accepted.
    TicketUpdateApproved {
        #[serde(default)]
        approved_by: Option<String>,
    },
    /// Human input: the proposed ticket update needs another pass.
    TicketUpdateRejected { feedback: String },
    /// Re-entry into a generation stage with all feedback gathered so far.
    RevisionRequested { attempt: u32, feedback: Vec<String> },
    RefinementComplete { ticket_id: TicketId, update: String },
    PlanGenerated { plan: String },
    PlanCommitted { reference: String },
    PlanSummaryPosted { comment_id: String },
    BranchesJoined { outputs: Vec<BranchOutput> },
    /// Human input (and planning's completion message): the plan is accepted.
    PlanApproved {
        #[serde(default)]
        plan: String,
        #[serde(default)]
        approved_by: Option<String>,
    },
    /// Human input: the plan needs another pass.
    PlanRejected { feedback: String },
    ImplementationReady { summary: String },
    PullRequestOpened { url: String },
    ImplementationComplete { pull_request_url: String },
}

impl WorkflowMessage {
    /// Serialized tag of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowMessage::TicketTriggered { .. } => "ticket_triggered",
            WorkflowMessage::QuestionsRequired { .. } => "questions_required",
            WorkflowMessage::QuestionsPosted { .. } => "questions_posted",
            WorkflowMessage::AnswersProvided { .. } => "answers_provided",
            WorkflowMessage::AnalysisComplete { .. } => "analysis_complete",
            WorkflowMessage::TicketUpdateDrafted { .. } => "ticket_update_drafted",
            WorkflowMessage::TicketUpdatePosted { .. } => "ticket_update_posted",
            WorkflowMessage::TicketUpdateApproved { .. } => "ticket_update_approved",
            WorkflowMessage::TicketUpdateRejected { .. } => "ticket_update_rejected",
            WorkflowMessage::RevisionRequested { .. } => "revision_requested",
            WorkflowMessage::RefinementComplete { .. } => "refinement_complete",
            WorkflowMessage::PlanGenerated { .. } => "plan_generated",
            WorkflowMessage::PlanCommitted { .. } => "plan_committed",
            WorkflowMessage::PlanSummaryPosted { .. } => "plan_summary_posted",
            WorkflowMessage::BranchesJoined { .. } => "branches_joined",
            WorkflowMessage::PlanApproved { .. } => "plan_approved",
            WorkflowMessage::PlanRejected { .. } => "plan_rejected",
            WorkflowMessage::ImplementationReady { .. } => "implementation_ready",
            WorkflowMessage::PullRequestOpened { .. } => "pull_request_opened",
            WorkflowMessage::ImplementationComplete { .. } => "implementation_complete",
        }
    }
}

/// The kind of external input a suspended graph is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingInput {
    /// Answers to clarifying questions posted on the ticket.
    Answers,
    /// Approval or rejection of the proposed ticket update.
    TicketUpdateReview,
    /// Approval or rejection of the implementation plan.
    PlanReview,
}

impl AwaitingInput {
    pub fn accepts(self, message: &WorkflowMessage) -> bool {
        match self {
            AwaitingInput::Answers => matches!(message, WorkflowMessage::AnswersProvided { .. }),
            AwaitingInput::TicketUpdateReview => matches!(
                message,
                WorkflowMessage::TicketUpdateApproved { .. }
                    | WorkflowMessage::TicketUpdateRejected { .. }
            ),
            AwaitingInput::PlanReview => matches!(
                message,
                WorkflowMessage::PlanApproved { .. } | WorkflowMessage::PlanRejected { .. }
            ),
        }
    }
}

impl fmt::Display for AwaitingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitingInput::Answers => write!(f, "answers to posted questions"),
            AwaitingInput::TicketUpdateReview => write!(f, "review of the ticket update"),
            AwaitingInput::PlanReview => write!(f, "review of the implementation plan"),
        }
    }
}

/// Human or webhook input delivered to a suspended ticket.
///
/// `id` is the caller's delivery identifier. Redelivering the same id is a
/// no-op, which is what makes resuming idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalInput {
    pub id: String,
    pub message: WorkflowMessage,
}

impl ExternalInput {
    pub fn new(id: impl Into<String>, message: WorkflowMessage) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }
}
