//! Refinement: analyze the ticket, ask clarifying questions when needed,
//! and post an improved ticket description.

use crate::error::WorkflowError;
use crate::message::{AwaitingInput, WorkflowMessage};
use crate::state_machine::{Phase, WorkflowState};

use super::definition::{GraphDefinition, Next, Routing, StageDescriptor, unexpected};

pub const ANALYZE: &str = "analyze";
pub const POST_QUESTIONS: &str = "post_questions";
pub const AWAIT_ANSWERS: &str = "await_answers";
pub const REFINE: &str = "refine_ticket";
pub const POST_UPDATE: &str = "post_ticket_update";
pub const AWAIT_UPDATE_REVIEW: &str = "await_update_review";

const UPDATE_REVISION: &str = "ticket_update";

pub fn definition() -> GraphDefinition {
    GraphDefinition {
        phase: Phase::Refinement,
        stages: vec![
            StageDescriptor::step(ANALYZE, "ticket_analyzer").entering(WorkflowState::Analyzing),
            StageDescriptor::effect(POST_QUESTIONS, "question_poster"),
            StageDescriptor::await_input(AWAIT_ANSWERS, AwaitingInput::Answers)
                .entering(WorkflowState::AwaitingAnswers),
            StageDescriptor::step(REFINE, "ticket_update_generator").entering(WorkflowState::RefiningTicket),
            StageDescriptor::effect(POST_UPDATE, "ticket_update_poster"),
            StageDescriptor::await_input(AWAIT_UPDATE_REVIEW, AwaitingInput::TicketUpdateReview)
                .entering(WorkflowState::TicketUpdateUnderReview),
        ],
        route,
    }
}

fn route(routing: &mut Routing<'_>, stage: &str, output: WorkflowMessage) -> Result<Next, WorkflowError> {
    match (stage, output) {
        (ANALYZE, message @ WorkflowMessage::QuestionsRequired { .. }) => Ok(Next::goto(POST_QUESTIONS, message)),
        (ANALYZE, WorkflowMessage::AnalysisComplete { summary }) => {
            routing.context().insert("analysis", &summary)?;
            Ok(Next::goto(REFINE, WorkflowMessage::AnalysisComplete { summary }))
        }
        (POST_QUESTIONS, message @ WorkflowMessage::QuestionsPosted { .. }) => {
            routing.transition(WorkflowState::QuestionsPosted, "clarifying questions posted")?;
            Ok(Next::goto(AWAIT_ANSWERS, message))
        }
        (AWAIT_ANSWERS, WorkflowMessage::AnswersProvided { answers }) => {
            routing.transition(WorkflowState::AnswersReceived, "answers received")?;
            for answer in &answers {
                routing.context().push("answers", answer.clone())?;
            }
            Ok(Next::goto(ANALYZE, WorkflowMessage::AnswersProvided { answers }))
        }
        (REFINE, message @ WorkflowMessage::TicketUpdateDrafted { .. }) => Ok(Next::goto(POST_UPDATE, message)),
        (POST_UPDATE, WorkflowMessage::TicketUpdatePosted { update }) => {
            routing.context().insert("ticket_update", &update)?;
            if routing.settings().review_ticket_updates {
                return Ok(Next::goto(
                    AWAIT_UPDATE_REVIEW,
                    WorkflowMessage::TicketUpdatePosted { update },
                ));
            }
            routing.transition(WorkflowState::TicketUpdateApproved, "ticket update needs no review")?;
            Ok(Next::Complete(completed(routing, update)))
        }
        (AWAIT_UPDATE_REVIEW, WorkflowMessage::TicketUpdateApproved { approved_by }) => {
            let reason = match approved_by {
                Some(reviewer) => format!("ticket update approved by {reviewer}"),
                None => "ticket update approved".to_string(),
            };
            routing.transition(WorkflowState::TicketUpdateApproved, reason)?;
            let update = routing.context().get("ticket_update").unwrap_or_default();
            Ok(Next::Complete(completed(routing, update)))
        }
        (AWAIT_UPDATE_REVIEW, WorkflowMessage::TicketUpdateRejected { feedback }) => {
            routing.transition(WorkflowState::TicketUpdateRejected, "ticket update rejected")?;
            let max = routing.limits().ticket_update;
            let revision = routing.request_revision(UPDATE_REVISION, max, feedback)?;
            Ok(Next::goto(REFINE, revision))
        }
        (stage, other) => Err(unexpected(stage, &other)),
    }
}

fn completed(routing: &mut Routing<'_>, update: String) -> WorkflowMessage {
    WorkflowMessage::RefinementComplete {
        ticket_id: routing.context().ticket_id().clone(),
        update,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::TenantSettings;
    use crate::error::StepFailure;
    use crate::graph::testing::ScriptedExecutor;
    use crate::graph::{AgentContext, Graph, GraphExecutionResult, GraphSettings};
    use crate::message::ExternalInput;
    use crate::ports::{MemoryCheckpointStore, RecordingEventPublisher};
    use crate::state_machine::{StateMachine, TenantId, Ticket, TicketId};

    fn graph(executor: Arc<ScriptedExecutor>) -> Graph {
        Graph::new(
            definition(),
            executor,
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(RecordingEventPublisher::new()),
            GraphSettings::default(),
        )
    }

    fn ticket() -> Ticket {
        Ticket::new(TicketId::from("T-1"), TenantId::from("acme"))
    }

    fn context(review: bool) -> AgentContext {
        AgentContext::new(TicketId::from("T-1"), TenantId::from("acme")).with_settings(TenantSettings {
            review_ticket_updates: review,
            ..TenantSettings::default()
        })
    }

    fn triggered() -> WorkflowMessage {
        WorkflowMessage::TicketTriggered {
            ticket_id: TicketId::from("T-1"),
        }
    }

    #[tokio::test]
    async fn clear_ticket_completes_without_review() {
        let executor = Arc::new(ScriptedExecutor::new());
        let graph = graph(executor.clone());
        let mut ticket = ticket();

        let result = graph.execute(&mut ticket, triggered(), &mut context(false)).await.unwrap();

        match result {
            GraphExecutionResult::Completed {
                message: WorkflowMessage::RefinementComplete { ticket_id, update },
            } => {
                assert_eq!(ticket_id.as_str(), "T-1");
                assert_eq!(update, "refined description");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(ticket.state(), WorkflowState::TicketUpdateApproved);
        assert_eq!(
            executor.calls(),
            vec!["ticket_analyzer", "ticket_update_generator", "ticket_update_poster"]
        );
        StateMachine::validate_history(&ticket).unwrap();
    }

    #[tokio::test]
    async fn questions_suspend_until_answered() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.script(
            "ticket_analyzer",
            Ok(WorkflowMessage::QuestionsRequired {
                questions: vec!["Which API version?".into()],
            }),
        );
        let graph = graph(executor.clone());
        let mut ticket = ticket();

        let result = graph.execute(&mut ticket, triggered(), &mut context(false)).await.unwrap();
        match result {
            GraphExecutionResult::Suspended {
                awaiting,
                message: WorkflowMessage::QuestionsPosted { questions },
            } => {
                assert_eq!(awaiting, AwaitingInput::Answers);
                assert_eq!(questions, vec!["Which API version?".to_string()]);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(ticket.state(), WorkflowState::AwaitingAnswers);

        let answers = ExternalInput::new(
            "comment-9",
            WorkflowMessage::AnswersProvided {
                answers: vec!["v2".into()],
            },
        );
        let result = graph
            .resume(&mut ticket, Some(answers), &mut context(false))
            .await
            .unwrap();

        assert!(matches!(result, GraphExecutionResult::Completed { .. }));
        assert_eq!(executor.calls_to("ticket_analyzer"), 2);
        assert_eq!(executor.calls_to("question_poster"), 1);
        let states: Vec<_> = ticket.events().iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::Analyzing,
                WorkflowState::QuestionsPosted,
                WorkflowState::AwaitingAnswers,
                WorkflowState::AnswersReceived,
                WorkflowState::Analyzing,
                WorkflowState::RefiningTicket,
                WorkflowState::TicketUpdateApproved,
            ]
        );
    }

    #[tokio::test]
    async fn reviewed_update_loops_on_rejection() {
        let executor = Arc::new(ScriptedExecutor::new());
        let graph = graph(executor.clone());
        let mut ticket = ticket();

        let result = graph.execute(&mut ticket, triggered(), &mut context(true)).await.unwrap();
        assert!(matches!(
            result,
            GraphExecutionResult::Suspended {
                awaiting: AwaitingInput::TicketUpdateReview,
                ..
            }
        ));
        assert_eq!(ticket.state(), WorkflowState::TicketUpdateUnderReview);

        let reject = ExternalInput::new(
            "review-1",
            WorkflowMessage::TicketUpdateRejected {
                feedback: "mention the migration".into(),
            },
        );
        let result = graph.resume(&mut ticket, Some(reject), &mut context(true)).await.unwrap();
        assert!(result.is_suspended());
        assert_eq!(executor.calls_to("ticket_update_generator"), 2);
        // The poster runs again for the new revision.
        assert_eq!(executor.calls_to("ticket_update_poster"), 2);

        let approve = ExternalInput::new(
            "review-2",
            WorkflowMessage::TicketUpdateApproved {
                approved_by: Some("pm".into()),
            },
        );
        let result = graph.resume(&mut ticket, Some(approve), &mut context(true)).await.unwrap();
        assert!(matches!(
            result,
            GraphExecutionResult::Completed {
                message: WorkflowMessage::RefinementComplete { .. }
            }
        ));
        assert_eq!(ticket.state(), WorkflowState::TicketUpdateApproved);
    }

    #[tokio::test]
    async fn ticket_update_revisions_are_bounded() {
        let executor = Arc::new(ScriptedExecutor::new());
        let graph = graph(executor.clone());
        let mut ticket = ticket();
        graph.execute(&mut ticket, triggered(), &mut context(true)).await.unwrap();
        assert_eq!(executor.calls_to("ticket_update_generator"), 1);

        let reject = |n: u32| {
            ExternalInput::new(
                format!("review-{n}"),
                WorkflowMessage::TicketUpdateRejected {
                    feedback: format!("round {n}"),
                },
            )
        };
        for n in 1..=3 {
            let result = graph.resume(&mut ticket, Some(reject(n)), &mut context(true)).await.unwrap();
            assert!(result.is_suspended(), "rejection {n} should loop back to review");
        }
        // Three regenerations on top of the first draft.
        assert_eq!(executor.calls_to("ticket_update_generator"), 4);

        let result = graph.resume(&mut ticket, Some(reject(4)), &mut context(true)).await.unwrap();
        match result {
            GraphExecutionResult::Failed { stage, error } => {
                assert_eq!(stage, AWAIT_UPDATE_REVIEW);
                assert!(matches!(error, WorkflowError::MaxRetriesExceeded { max: 3, .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(executor.calls_to("ticket_update_generator"), 4);
        assert_eq!(ticket.state(), WorkflowState::TicketUpdateRejected);
        StateMachine::validate_history(&ticket).unwrap();
    }

    #[tokio::test]
    async fn analyzer_failure_fails_the_graph() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.script(
            "ticket_analyzer",
            Err(StepFailure::Permanent("ticket body is empty".into())),
        );
        let graph = graph(executor);
        let mut ticket = ticket();

        let result = graph.execute(&mut ticket, triggered(), &mut context(false)).await.unwrap();
        match result {
            GraphExecutionResult::Failed { stage, error } => {
                assert_eq!(stage, ANALYZE);
                assert!(matches!(error, WorkflowError::StepPermanentFailure { .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(ticket.state(), WorkflowState::Analyzing);
    }

    #[tokio::test]
    async fn unexpected_step_output_fails_the_graph() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.script(
            "ticket_analyzer",
            Ok(WorkflowMessage::PlanGenerated { plan: "?".into() }),
        );
        let graph = graph(executor);
        let result = graph
            .execute(&mut ticket(), triggered(), &mut context(false))
            .await
            .unwrap();
        assert!(matches!(
            result,
            GraphExecutionResult::Failed {
                error: WorkflowError::UnexpectedMessage { .. },
                ..
            }
        ));
    }
}
