//! Implementation: write the code for an approved plan and open a pull request.

use crate::error::WorkflowError;
use crate::message::WorkflowMessage;
use crate::state_machine::{Phase, WorkflowState};

use super::definition::{GraphDefinition, Next, Routing, StageDescriptor, unexpected};

pub const IMPLEMENT: &str = "implement";
pub const OPEN_PULL_REQUEST: &str = "open_pull_request";

pub fn definition() -> GraphDefinition {
    GraphDefinition {
        phase: Phase::Implementation,
        stages: vec![
            StageDescriptor::step(IMPLEMENT, "code_implementer").entering(WorkflowState::Implementing),
            StageDescriptor::effect(OPEN_PULL_REQUEST, "pull_request_creator"),
        ],
        route,
    }
}

fn route(_routing: &mut Routing<'_>, stage: &str, output: WorkflowMessage) -> Result<Next, WorkflowError> {
    match (stage, output) {
        (IMPLEMENT, message @ WorkflowMessage::ImplementationReady { .. }) => {
            Ok(Next::goto(OPEN_PULL_REQUEST, message))
        }
        (OPEN_PULL_REQUEST, WorkflowMessage::PullRequestOpened { url }) => {
            Ok(Next::Complete(WorkflowMessage::ImplementationComplete { pull_request_url: url }))
        }
        (stage, other) => Err(unexpected(stage, &other)),
    }
}
