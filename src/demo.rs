//! Built-in scenario: a rate-limiting ticket that needs one round of
//! questions and one plan revision before it ships.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use ticketflow::graph::AgentContext;
use ticketflow::ports::AgentExecutor;
use ticketflow::{
    AwaitingInput, ExternalInput, OrchestrationOutcome, OrchestrationResult, StepFailure, TenantId,
    TicketId, TicketflowConfig, WorkflowMessage, WorkflowOrchestrator,
};

/// Canned agent standing in for the AI, Git and tracker integrations.
pub struct DemoExecutor {
    latency: Duration,
}

impl DemoExecutor {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(150),
        }
    }
}

#[async_trait]
impl AgentExecutor for DemoExecutor {
    async fn execute(
        &self,
        step: &str,
        input: &WorkflowMessage,
        context: &AgentContext,
        _deadline: Instant,
    ) -> Result<WorkflowMessage, StepFailure> {
        tokio::time::sleep(self.latency).await;
        let ticket = context.ticket_id();
        let output = match (step, input) {
            ("ticket_analyzer", WorkflowMessage::TicketTriggered { .. }) => WorkflowMessage::QuestionsRequired {
                questions: vec![
                    "Which endpoints need rate limiting?".into(),
                    "Should limits apply per user or per API key?".into(),
                ],
            },
            ("ticket_analyzer", _) => WorkflowMessage::AnalysisComplete {
                summary: "Limit the public API per API key with a token bucket".into(),
            },
            ("question_poster", WorkflowMessage::QuestionsRequired { questions }) => {
                WorkflowMessage::QuestionsPosted {
                    questions: questions.clone(),
                }
            }
            ("ticket_update_generator", _) => WorkflowMessage::TicketUpdateDrafted {
                update: "Add per-API-key token bucket limits to /v1/* with 429 responses".into(),
            },
            ("ticket_update_poster", WorkflowMessage::TicketUpdateDrafted { update }) => {
                WorkflowMessage::TicketUpdatePosted { update: update.clone() }
            }
            ("plan_generator", WorkflowMessage::RevisionRequested { attempt, feedback }) => {
                WorkflowMessage::PlanGenerated {
                    plan: format!(
                        "Revision {attempt}: middleware, Redis-backed buckets, metrics; addresses: {}",
                        feedback.join("; ")
                    ),
                }
            }
            ("plan_generator", _) => WorkflowMessage::PlanGenerated {
                plan: "Middleware with in-process token buckets".into(),
            },
            ("plan_committer", _) => WorkflowMessage::PlanCommitted {
                reference: format!("plans/{ticket}.md@{}", &Uuid::new_v4().simple().to_string()[..8]),
            },
            ("plan_summary_poster", _) => WorkflowMessage::PlanSummaryPosted {
                comment_id: Uuid::new_v4().to_string(),
            },
            ("code_implementer", _) => WorkflowMessage::ImplementationReady {
                summary: "4 files changed, 212 insertions".into(),
            },
            ("pull_request_creator", _) => WorkflowMessage::PullRequestOpened {
                url: format!("https://git.example.com/demo/api/pull/{ticket}"),
            },
            (step, input) => {
                return Err(StepFailure::Permanent(format!(
                    "demo has no answer for {step} given {}",
                    input.kind()
                )));
            }
        };
        Ok(output)
    }
}

/// Play the human side of the scenario until the ticket stops waiting.
pub async fn run(
    orchestrator: Arc<WorkflowOrchestrator>,
    config: &TicketflowConfig,
    tenant_id: TenantId,
    ticket_id: TicketId,
) -> Result<()> {
    println!("ticketflow demo: ticket {ticket_id} for tenant {tenant_id}");
    println!("  data dir: {}", config.data_dir.display());

    let mut result = orchestrator.start(&tenant_id, &ticket_id).await?;
    print_result(&result);
    let mut plan_reviews = 0;

    while let OrchestrationOutcome::Suspended { awaiting } = result.outcome {
        let message = match awaiting {
            AwaitingInput::Answers => WorkflowMessage::AnswersProvided {
                answers: vec!["All public /v1 endpoints".into(), "Per API key".into()],
            },
            AwaitingInput::TicketUpdateReview => WorkflowMessage::TicketUpdateApproved {
                approved_by: Some("product-owner".into()),
            },
            AwaitingInput::PlanReview => {
                plan_reviews += 1;
                if plan_reviews == 1 {
                    WorkflowMessage::PlanRejected {
                        feedback: "Limits must survive restarts; use Redis".into(),
                    }
                } else {
                    WorkflowMessage::PlanApproved {
                        plan: String::new(),
                        approved_by: Some("tech-lead".into()),
                    }
                }
            }
        };
        println!("  -> human replies with {}", message.kind());
        let input = ExternalInput::new(Uuid::new_v4().to_string(), message);
        result = orchestrator.resume(&ticket_id, input).await?;
        print_result(&result);
    }

    let status = orchestrator.status(&ticket_id).await?;
    println!();
    println!("{}", serde_json::to_string_pretty(&status.summary)?);
    Ok(())
}

fn print_result(result: &OrchestrationResult) {
    let outcome = match &result.outcome {
        OrchestrationOutcome::Suspended { awaiting } => format!("waiting for {awaiting}"),
        OrchestrationOutcome::Completed => "completed".to_string(),
        OrchestrationOutcome::Failed { stage, reason } => format!("failed at {stage}: {reason}"),
        OrchestrationOutcome::Cancelled => "cancelled".to_string(),
        OrchestrationOutcome::Interrupted => "interrupted".to_string(),
    };
    println!("  [{}] {} ({})", result.phase, result.state, outcome);
}
