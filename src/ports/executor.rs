use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StepFailure;
use crate::graph::AgentContext;
use crate::message::WorkflowMessage;

/// Runs the business logic behind a named step.
///
/// This is where AI calls, Git operations and tracker API calls are
/// injected. The core never looks inside a step; it only reads the
/// returned message or failure. Implementations should give up by
/// `deadline`; the core also enforces it and treats an overrun as a
/// transient failure.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &str,
        input: &WorkflowMessage,
        context: &AgentContext,
        deadline: Instant,
    ) -> Result<WorkflowMessage, StepFailure>;
}
