//! Planning: generate an implementation plan, publish it, and wait for review.

use crate::error::WorkflowError;
use crate::message::{AwaitingInput, WorkflowMessage};
use crate::state_machine::{Phase, WorkflowState};

use super::definition::{GraphDefinition, Next, Routing, StageDescriptor, unexpected};

pub const GENERATE: &str = "generate_plan";
pub const PUBLISH: &str = "publish_plan";
pub const AWAIT_REVIEW: &str = "await_plan_review";

const PLAN_REVISION: &str = "plan";

pub fn definition() -> GraphDefinition {
    GraphDefinition {
        phase: Phase::Planning,
        stages: vec![
            StageDescriptor::step(GENERATE, "plan_generator").entering(WorkflowState::Planning),
            StageDescriptor::parallel(PUBLISH, &["plan_committer", "plan_summary_poster"]),
            StageDescriptor::await_input(AWAIT_REVIEW, AwaitingInput::PlanReview)
                .entering(WorkflowState::PlanUnderReview),
        ],
        route,
    }
}

fn route(routing: &mut Routing<'_>, stage: &str, output: WorkflowMessage) -> Result<Next, WorkflowError> {
    match (stage, output) {
        (GENERATE, WorkflowMessage::PlanGenerated { plan }) => {
            routing.context().insert("plan", &plan)?;
            Ok(Next::goto(PUBLISH, WorkflowMessage::PlanGenerated { plan }))
        }
        (PUBLISH, message @ WorkflowMessage::BranchesJoined { .. }) => Ok(Next::goto(AWAIT_REVIEW, message)),
        (AWAIT_REVIEW, WorkflowMessage::PlanApproved { plan, approved_by }) => {
            let reason = match &approved_by {
                Some(reviewer) => format!("plan approved by {reviewer}"),
                None => "plan approved".to_string(),
            };
            routing.transition(WorkflowState::PlanApproved, reason)?;
            // The reviewed plan is the one generated here, not whatever the
            // reviewer's payload carried.
            let plan = routing.context().get("plan").unwrap_or(plan);
            Ok(Next::Complete(WorkflowMessage::PlanApproved { plan, approved_by }))
        }
        (AWAIT_REVIEW, WorkflowMessage::PlanRejected { feedback }) => {
            routing.transition(WorkflowState::PlanRejected, "plan rejected")?;
            let max = routing.limits().plan;
            let revision = routing.request_revision(PLAN_REVISION, max, feedback)?;
            Ok(Next::goto(GENERATE, revision))
        }
        (stage, other) => Err(unexpected(stage, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_runs_both_branches() {
        let definition = definition();
        let publish = definition.stage(PUBLISH).unwrap();
        assert!(publish.has_effects());
        assert_eq!(
            publish.action,
            crate::graph::StageAction::Parallel {
                steps: &["plan_committer", "plan_summary_poster"]
            }
        );
        assert_eq!(definition.entry().unwrap().name, GENERATE);
    }
}
