use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

use super::context::AgentContext;
use crate::error::{StepFailure, WorkflowError};
use crate::message::WorkflowMessage;
use crate::ports::AgentExecutor;

/// Configuration for retrying transient step failures with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per step invocation, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Invoke `step` until it succeeds, fails permanently, or runs out of attempts.
///
/// Every attempt gets its own deadline of `step_timeout`; overrunning it
/// counts as a transient failure. Backoff sleeps end early on cancellation.
pub(crate) async fn invoke_with_retry(
    executor: &dyn AgentExecutor,
    step: &str,
    input: &WorkflowMessage,
    context: &AgentContext,
    policy: &RetryPolicy,
    step_timeout: Duration,
) -> Result<WorkflowMessage, WorkflowError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let deadline = Instant::now() + step_timeout;
        let result = match timeout_at(deadline, executor.execute(step, input, context, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(StepFailure::Transient(format!(
                "deadline of {}ms exceeded",
                step_timeout.as_millis()
            ))),
        };

        match result {
            Ok(output) => {
                debug!(step, attempt, output = output.kind(), "step succeeded");
                return Ok(output);
            }
            Err(StepFailure::Permanent(reason)) => {
                return Err(WorkflowError::StepPermanentFailure {
                    step: step.to_string(),
                    reason,
                });
            }
            Err(StepFailure::Transient(reason)) => {
                if attempt >= max_attempts {
                    return Err(WorkflowError::StepTransientFailure {
                        step: step.to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                let delay_ms = policy.delay_for_attempt(attempt);
                warn!(
                    ticket_id = %context.ticket_id(),
                    step,
                    attempt,
                    max_attempts,
                    delay_ms,
                    %reason,
                    "transient step failure, retrying"
                );
                tokio::select! {
                    _ = context.cancellation().cancelled() => return Err(WorkflowError::Cancelled),
                    _ = sleep(Duration::from_millis(delay_ms)) => {}
                }
            }
        }
    }
}
