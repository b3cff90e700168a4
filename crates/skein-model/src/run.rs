//! Run-time counterpart of a workflow definition.
//!
//! A `WorkflowRun` tracks one execution attempt: status transitions, per-step
//! results in definition order, and an append-only execution log. Transitions
//! are one-directional; terminal states never change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ModelError;
use crate::workflow::Workflow;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One timestamped entry in a run's append-only execution log.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Step this entry relates to, if any.
    pub step_id: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn info(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, step_id, message)
    }

    pub fn warn(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, step_id, message)
    }

    pub fn error(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, step_id, message)
    }

    fn new(level: LogLevel, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Per-step outcome within a run.
///
/// Created when a step is dispatched and finalized exactly once; retries
/// update `attempt_count` and overwrite status rather than creating
/// duplicate entries.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub agent_id: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Wall-clock time summed across all attempts, in milliseconds.
    pub execution_time_ms: u64,
    /// Total attempts made (1 on first success, retries included).
    pub attempt_count: u32,
}

impl StepResult {
    /// A result slot for a step that has not been dispatched yet.
    pub fn pending(step_id: &str, agent_id: &str) -> Self {
        Self {
            step_id: step_id.into(),
            agent_id: agent_id.into(),
            status: StepStatus::Pending,
            input: Value::Null,
            output: None,
            error: None,
            execution_time_ms: 0,
            attempt_count: 0,
        }
    }

    /// Mark this slot skipped with a reason; no side effects occurred.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
    }
}

/// One execution attempt of a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Definition version this run executed.
    pub workflow_version: u32,
    pub user_id: String,
    /// Run-level input, exposed to steps under the `input` context key.
    pub input: Value,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Step results in definition order, regardless of completion timing.
    pub results: Vec<StepResult>,
    /// Append-only, monotonically ordered execution log.
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Create a PENDING run for a workflow, with a result slot pre-allocated
    /// per step in definition order.
    pub fn new(workflow: &Workflow, user_id: &str, input: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            user_id: user_id.into(),
            input,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            results: workflow
                .steps
                .iter()
                .map(|s| StepResult::pending(&s.id, &s.agent_id))
                .collect(),
            logs: Vec::new(),
            error: None,
        }
    }

    /// PENDING -> RUNNING.
    pub fn start(&mut self) -> Result<(), ModelError> {
        if self.status != RunStatus::Pending {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: RunStatus::Running,
            });
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.log(LogEntry::info(None, "run started"));
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(&mut self) -> Result<(), ModelError> {
        self.finish(RunStatus::Completed, None)
    }

    /// PENDING/RUNNING -> FAILED.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), ModelError> {
        self.finish(RunStatus::Failed, Some(message.into()))
    }

    /// PENDING/RUNNING -> CANCELLED.
    pub fn cancel(&mut self) -> Result<(), ModelError> {
        self.finish(RunStatus::Cancelled, None)
    }

    fn finish(&mut self, to: RunStatus, error: Option<String>) -> Result<(), ModelError> {
        if self.status.is_terminal() || (to == RunStatus::Completed && self.status != RunStatus::Running) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.completed_at = Some(Utc::now());
        if let Some(msg) = error {
            self.logs.push(LogEntry::error(None, msg.clone()));
            self.error = Some(msg);
        }
        Ok(())
    }

    /// Append an entry to the execution log.
    pub fn log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    /// Mutable access to a step's result slot.
    pub fn result_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.results.iter_mut().find(|r| r.step_id == step_id)
    }

    /// Read access to a step's result slot.
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    /// Elapsed wall-clock time since start, up to completion if terminal.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Workflow, WorkflowConfig, WorkflowStep};
    use serde_json::json;

    fn test_workflow() -> Workflow {
        Workflow {
            id: "wf-1".into(),
            name: "test".into(),
            description: String::new(),
            version: 3,
            user_id: "u-1".into(),
            steps: vec![
                WorkflowStep {
                    id: "a".into(),
                    agent_id: "http".into(),
                    agent_version: "latest".into(),
                    action: "get".into(),
                    input: json!({}),
                    depends_on: vec![],
                    timeout_seconds: 10,
                    retry_count: 0,
                    condition: None,
                },
                WorkflowStep {
                    id: "b".into(),
                    agent_id: "database".into(),
                    agent_version: "latest".into(),
                    action: "insert".into(),
                    input: json!({}),
                    depends_on: vec!["a".into()],
                    timeout_seconds: 10,
                    retry_count: 0,
                    condition: None,
                },
            ],
            config: WorkflowConfig::default(),
        }
    }

    #[test]
    fn test_new_run_pending_with_slots() {
        let run = WorkflowRun::new(&test_workflow(), "u-1", json!({"k": 1}));
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.workflow_version, 3);
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].step_id, "a");
        assert_eq!(run.results[1].agent_id, "database");
        assert!(run.results.iter().all(|r| r.status == StepStatus::Pending));
        assert!(run.started_at.is_none());
    }

    #[test]
    fn test_start_transition() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.start().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        assert!(run.logs.iter().any(|l| l.message == "run started"));
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.start().unwrap();
        let err = run.start().unwrap_err();
        assert!(matches!(err, ModelError::InvalidTransition { .. }));
    }

    #[test]
    fn test_complete_requires_running() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        assert!(run.complete().is_err());
        run.start().unwrap();
        run.complete().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_fail_records_error() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.start().unwrap();
        run.fail("agent exploded").unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("agent exploded"));
        assert!(run.logs.iter().any(|l| l.message.contains("exploded")));
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.cancel().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.start().unwrap();
        run.complete().unwrap();
        assert!(run.fail("late").is_err());
        assert!(run.cancel().is_err());
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_result_slot_access() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.result_mut("b").unwrap().skip("upstream stop");
        assert_eq!(run.result("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.result("b").unwrap().error.as_deref(),
            Some("upstream stop")
        );
        assert!(run.result("missing").is_none());
    }

    #[test]
    fn test_logs_are_monotonic() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        run.log(LogEntry::info(Some("a"), "first"));
        run.log(LogEntry::warn(Some("a"), "second"));
        assert_eq!(run.logs.len(), 2);
        assert!(run.logs[0].timestamp <= run.logs[1].timestamp);
        assert_eq!(run.logs[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_elapsed() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({}));
        assert!(run.elapsed().is_none());
        run.start().unwrap();
        assert!(run.elapsed().unwrap() >= chrono::Duration::zero());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut run = WorkflowRun::new(&test_workflow(), "u-1", json!({"x": true}));
        run.start().unwrap();
        let json_str = serde_json::to_string(&run).unwrap();
        let back: WorkflowRun = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.status, RunStatus::Running);
        assert_eq!(back.results.len(), 2);
    }
}
