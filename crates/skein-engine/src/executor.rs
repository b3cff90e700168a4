//! Single-step execution: conditions, placeholder resolution, timeout,
//! and retry with exponential backoff.
//!
//! The executor never fails the caller; every outcome, including internal
//! errors, is captured in the returned [`StepResult`] so the engine can
//! apply the run's failure strategy uniformly.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use skein_model::{LogEntry, RetryPolicy, StepResult, StepStatus, WorkflowStep};

use crate::agent::{AgentInvocation, AgentInvoker};
use crate::context::RunContext;

/// Result of one step plus the audit log lines it produced. Logs are
/// returned rather than written so parallel steps never interleave entries
/// mid-step; the engine merges them in definition order.
pub struct StepOutcome {
    pub result: StepResult,
    pub logs: Vec<LogEntry>,
}

/// Executes one step at a time against an [`AgentInvoker`].
pub struct StepExecutor {
    invoker: Arc<dyn AgentInvoker>,
}

impl StepExecutor {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }

    /// Run a step to a terminal status.
    ///
    /// - A false condition skips the step without invoking the agent.
    /// - An unresolvable placeholder fails the step before the first attempt.
    /// - Each attempt gets the step's full timeout; a failed or timed-out
    ///   attempt retries up to `retry_count` times with backoff from
    ///   `retry_policy`.
    /// - Cancellation interrupts backoff waits and in-flight attempts; a
    ///   cancelled step reports `Failed` with a cancellation message.
    pub async fn execute(
        &self,
        run_id: Uuid,
        step: &WorkflowStep,
        ctx: &RunContext,
        retry_policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut result = StepResult::pending(&step.id, &step.agent_id);
        let mut logs = Vec::new();

        if let Some(condition) = &step.condition
            && !ctx.evaluate(condition)
        {
            result.skip("condition not met");
            logs.push(LogEntry::info(
                Some(&step.id),
                "Step skipped: condition not met",
            ));
            return StepOutcome { result, logs };
        }

        let input = match ctx.resolve_input(&step.id, &step.input) {
            Ok(input) => input,
            Err(e) => {
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                logs.push(LogEntry::error(Some(&step.id), e.to_string()));
                return StepOutcome { result, logs };
            }
        };
        result.input = input.clone();
        result.status = StepStatus::Running;
        logs.push(LogEntry::info(
            Some(&step.id),
            format!("Step started: {}.{}", step.agent_id, step.action),
        ));

        let invocation = AgentInvocation {
            agent_id: step.agent_id.clone(),
            agent_version: step.agent_version.clone(),
            action: step.action.clone(),
            input,
            run_id,
            step_id: step.id.clone(),
            timeout: Duration::from_secs(step.timeout_seconds),
            credential_ref: None,
        };

        let max_attempts = step.retry_count + 1;
        // Time spent inside attempts only; backoff waits are not execution.
        let mut attempt_time = Duration::ZERO;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                last_error = "step cancelled".to_string();
                break;
            }
            result.attempt_count = attempt + 1;

            let attempt_started = tokio::time::Instant::now();
            let attempt_result =
                tokio::time::timeout(invocation.timeout, self.invoker.invoke(&invocation, cancel))
                    .await;
            attempt_time += attempt_started.elapsed();

            match attempt_result {
                Ok(Ok(output)) => {
                    result.status = StepStatus::Completed;
                    result.output = Some(output);
                    result.execution_time_ms = attempt_time.as_millis() as u64;
                    logs.push(LogEntry::info(
                        Some(&step.id),
                        format!(
                            "Step completed in {}ms (attempt {})",
                            result.execution_time_ms, result.attempt_count
                        ),
                    ));
                    return StepOutcome { result, logs };
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!("timed out after {}s", step.timeout_seconds);
                }
            }

            if cancel.is_cancelled() {
                last_error = "step cancelled".to_string();
                break;
            }

            let attempts_left = max_attempts - attempt - 1;
            if attempts_left > 0 {
                let delay = retry_policy.delay_for_attempt(attempt);
                warn!(
                    step_id = %step.id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Step attempt failed, retrying"
                );
                logs.push(LogEntry::warn(
                    Some(&step.id),
                    format!(
                        "Attempt {} failed ({last_error}), retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    ),
                ));
                // Backoff must remain cancellable.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        last_error = "step cancelled".to_string();
                        break;
                    }
                }
            }
        }

        debug!(step_id = %step.id, error = %last_error, "Step failed");
        result.status = StepStatus::Failed;
        result.error = Some(last_error.clone());
        result.execution_time_ms = attempt_time.as_millis() as u64;
        logs.push(LogEntry::error(
            Some(&step.id),
            format!(
                "Step failed after {} attempt(s): {last_error}",
                result.attempt_count
            ),
        ));
        StepOutcome { result, logs }
    }
}
