//! Workflow orchestration.
//!
//! `OrchestrationEngine` drives a run from `Pending` to a terminal status:
//! it plans the dependency levels, dispatches steps sequentially or with
//! bounded parallelism, applies the workflow's failure strategy, enforces
//! the whole-run deadline, and checkpoints the run after every level so
//! state is observable while execution is in flight.
//!
//! Step-level failures never surface as errors here; they land in the
//! run's step results and the failure strategy decides what they mean for
//! the run. `execute` only returns `Err` when a run cannot start at all
//! (invalid workflow, dependency cycle, engine at capacity).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use skein_model::{
    ExecutionStrategy, FailureStrategy, LogEntry, RetryPolicy, RunStatus, StepResult, StepStatus,
    Workflow, WorkflowRun, WorkflowStep,
};

use crate::agent::{AgentInvoker, DryRunInvoker};
use crate::context::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::executor::{StepExecutor, StepOutcome};
use crate::planner;
use crate::store::{RunStore, WorkflowStore};

/// Engine-wide limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on concurrently executing runs across all users.
    pub max_active_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_runs: 32,
        }
    }
}

/// Read-only view of an in-flight run.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRunInfo {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

struct ActiveRun {
    workflow_id: String,
    user_id: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// How a run's level loop ended.
enum RunEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// Plans and executes workflow runs.
pub struct OrchestrationEngine {
    executor: Arc<StepExecutor>,
    store: Arc<dyn RunStore>,
    config: EngineConfig,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
}

impl OrchestrationEngine {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        store: Arc<dyn RunStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(invoker)),
            store,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Execute a workflow to a terminal status.
    ///
    /// Returns the finished run; step failures, timeouts, and cancellation
    /// are all reported through the run itself. `Err` means the run never
    /// started: invalid definition, dependency cycle, or engine capacity.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        user_id: &str,
        input: Value,
    ) -> EngineResult<WorkflowRun> {
        self.execute_with(workflow, user_id, input, Arc::clone(&self.executor))
            .await
    }

    /// Load a stored workflow and execute it.
    pub async fn execute_by_id(
        &self,
        workflows: &dyn WorkflowStore,
        workflow_id: &str,
        user_id: &str,
        input: Value,
    ) -> EngineResult<WorkflowRun> {
        let workflow = workflows
            .find_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        self.execute(&workflow, user_id, input).await
    }

    /// Execute without side effects: every step runs against a simulated
    /// agent whose output mirrors the resolved input. Validates the
    /// definition, the plan, and the data flow between steps.
    pub async fn dry_run(
        &self,
        workflow: &Workflow,
        user_id: &str,
        input: Value,
    ) -> EngineResult<WorkflowRun> {
        let executor = Arc::new(StepExecutor::new(Arc::new(DryRunInvoker)));
        self.execute_with(workflow, user_id, input, executor).await
    }

    async fn execute_with(
        &self,
        workflow: &Workflow,
        user_id: &str,
        input: Value,
        executor: Arc<StepExecutor>,
    ) -> EngineResult<WorkflowRun> {
        workflow.validate()?;
        // Ownership is checked before any state is created or mutated.
        if workflow.user_id != user_id {
            return Err(EngineError::NotAuthorized(format!(
                "user '{user_id}' does not own workflow '{}'",
                workflow.id
            )));
        }
        let plan = planner::plan(workflow)?;

        let mut run = WorkflowRun::new(workflow, user_id, input);
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if active.len() >= self.config.max_active_runs {
                return Err(EngineError::CapacityExceeded {
                    active: active.len(),
                    max: self.config.max_active_runs,
                });
            }
            active.insert(
                run.run_id,
                ActiveRun {
                    workflow_id: workflow.id.clone(),
                    user_id: user_id.to_string(),
                    status: run.status,
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                },
            );
        }
        info!(
            run_id = %run.run_id,
            workflow_id = %workflow.id,
            steps = plan.step_count(),
            "Run starting"
        );

        let levels: Vec<Vec<String>> = match workflow.config.execution_strategy {
            ExecutionStrategy::Sequential => plan
                .flatten_sequential()
                .into_iter()
                .map(|id| vec![id])
                .collect(),
            ExecutionStrategy::Parallel => plan.levels,
        };

        let outcome = self
            .drive(&mut run, workflow, &levels, executor, &cancel)
            .await;
        self.active.lock().remove(&run.run_id);

        if let Err(e) = outcome {
            // Infrastructure failure mid-run: the run still ends terminal.
            error!(run_id = %run.run_id, error = %e, "Run aborted by engine error");
            cancel.cancel();
            skip_unfinished(&mut run, "engine error");
            if !run.status.is_terminal() {
                let _ = run.fail(format!("engine error: {e}"));
            }
        }
        if let Err(e) = self.store.save_run(&run).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to persist finished run");
        }
        info!(run_id = %run.run_id, status = ?run.status, "Run finished");
        Ok(run)
    }

    async fn drive(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        levels: &[Vec<String>],
        executor: Arc<StepExecutor>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        run.start()?;
        if let Some(entry) = self.active.lock().get_mut(&run.run_id) {
            entry.status = run.status;
        }
        self.store.save_run(run).await?;

        let deadline = Duration::from_secs(workflow.config.timeout_minutes * 60);
        let end = tokio::time::timeout(
            deadline,
            self.run_levels(run, workflow, levels, executor, cancel),
        )
        .await;

        match end {
            Ok(Ok(RunEnd::Completed)) => {
                run.log(LogEntry::info(None, "run completed"));
                run.complete()?;
            }
            Ok(Ok(RunEnd::Failed(message))) => {
                run.fail(message)?;
            }
            Ok(Ok(RunEnd::Cancelled)) => {
                run.log(LogEntry::info(None, "cancelled by user"));
                run.cancel()?;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // Whole-run deadline: stop in-flight work, skip the rest.
                cancel.cancel();
                skip_unfinished(run, "run timed out");
                run.fail(format!(
                    "run timed out after {} minute(s)",
                    workflow.config.timeout_minutes
                ))?;
            }
        }
        Ok(())
    }

    async fn run_levels(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        levels: &[Vec<String>],
        executor: Arc<StepExecutor>,
        cancel: &CancellationToken,
    ) -> EngineResult<RunEnd> {
        // Steps condemned by an upstream failure under the continue strategy.
        let mut condemned: HashSet<String> = HashSet::new();
        let max_parallel = workflow.config.max_parallel_steps.max(1);

        for level in levels {
            if cancel.is_cancelled() {
                skip_unfinished(run, "run cancelled");
                return Ok(RunEnd::Cancelled);
            }

            let mut to_run: Vec<WorkflowStep> = Vec::new();
            for step_id in level {
                if condemned.contains(step_id) {
                    if let Some(slot) = run.result_mut(step_id) {
                        slot.skip("upstream failure");
                    }
                    run.log(LogEntry::info(
                        Some(step_id),
                        "Step skipped: upstream failure",
                    ));
                } else if let Some(step) = workflow.step(step_id) {
                    to_run.push(step.clone());
                }
            }

            let ctx = Arc::new(RunContext::for_run(run));
            let outcomes = if to_run.len() <= 1 {
                let mut outcomes = Vec::with_capacity(to_run.len());
                for step in &to_run {
                    outcomes.push(
                        executor
                            .execute(run.run_id, step, &ctx, &workflow.config.retry_policy, cancel)
                            .await,
                    );
                }
                outcomes
            } else {
                run_level_parallel(
                    Arc::clone(&executor),
                    run.run_id,
                    to_run,
                    Arc::clone(&ctx),
                    workflow.config.retry_policy.clone(),
                    cancel.clone(),
                    max_parallel,
                )
                .await
            };

            // Merge outcomes in definition order; parallel completion order
            // never leaks into results or logs.
            let mut failures: Vec<(String, String)> = Vec::new();
            for outcome in outcomes {
                for entry in outcome.logs {
                    run.log(entry);
                }
                if outcome.result.status == StepStatus::Failed {
                    failures.push((
                        outcome.result.step_id.clone(),
                        outcome.result.error.clone().unwrap_or_default(),
                    ));
                }
                if let Some(slot) = run.result_mut(&outcome.result.step_id) {
                    *slot = outcome.result;
                }
            }
            self.store.save_run(run).await?;

            if cancel.is_cancelled() {
                skip_unfinished(run, "run cancelled");
                return Ok(RunEnd::Cancelled);
            }

            if !failures.is_empty() {
                match workflow.config.failure_strategy {
                    FailureStrategy::Stop => {
                        skip_unfinished(run, "upstream stop");
                        let (step_id, message) = &failures[0];
                        return Ok(RunEnd::Failed(format!(
                            "step '{step_id}' failed: {message}"
                        )));
                    }
                    FailureStrategy::Continue => {
                        for (step_id, _) in &failures {
                            condemned.extend(planner::transitive_dependents(workflow, step_id));
                        }
                    }
                }
            }
        }

        Ok(RunEnd::Completed)
    }

    /// Request cancellation of an in-flight run.
    ///
    /// Only the run's owner may cancel it. Idempotent: cancelling a run
    /// that already reached a terminal status is a no-op.
    pub async fn cancel(&self, run_id: Uuid, user_id: &str) -> EngineResult<()> {
        {
            let active = self.active.lock();
            if let Some(entry) = active.get(&run_id) {
                if entry.user_id != user_id {
                    return Err(EngineError::NotAuthorized(format!(
                        "user '{user_id}' does not own run {run_id}"
                    )));
                }
                info!(run_id = %run_id, user_id = %user_id, "Cancellation requested");
                entry.cancel.cancel();
                return Ok(());
            }
        }

        // Not active: a terminal run cancels as a no-op, anything else is
        // unknown.
        match self.store.find_run(run_id).await? {
            Some(run) if run.user_id != user_id => Err(EngineError::NotAuthorized(format!(
                "user '{user_id}' does not own run {run_id}"
            ))),
            Some(run) if run.status.is_terminal() => Ok(()),
            _ => Err(EngineError::RunNotFound(run_id)),
        }
    }

    /// Number of in-flight runs.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot of in-flight runs, for admin tooling.
    pub fn active_runs(&self) -> Vec<ActiveRunInfo> {
        self.active
            .lock()
            .iter()
            .map(|(run_id, entry)| ActiveRunInfo {
                run_id: *run_id,
                workflow_id: entry.workflow_id.clone(),
                user_id: entry.user_id.clone(),
                status: entry.status,
                started_at: entry.started_at,
            })
            .collect()
    }
}

/// Dispatch one level's steps concurrently, bounded by `max_parallel`.
/// Outcomes come back in the order steps were submitted.
async fn run_level_parallel(
    executor: Arc<StepExecutor>,
    run_id: Uuid,
    steps: Vec<WorkflowStep>,
    ctx: Arc<RunContext>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    max_parallel: usize,
) -> Vec<StepOutcome> {
    let ids: Vec<(String, String)> = steps
        .iter()
        .map(|s| (s.id.clone(), s.agent_id.clone()))
        .collect();
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut join_set = JoinSet::new();

    for (idx, step) in steps.into_iter().enumerate() {
        let executor = Arc::clone(&executor);
        let ctx = Arc::clone(&ctx);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let retry_policy = retry_policy.clone();
        join_set.spawn(async move {
            // Holding the acquire result keeps the permit for the task's
            // lifetime; the semaphore is never closed.
            let _permit = semaphore.acquire_owned().await;
            let outcome = executor
                .execute(run_id, &step, &ctx, &retry_policy, &cancel)
                .await;
            (idx, outcome)
        });
    }

    let mut slots: Vec<Option<StepOutcome>> = ids.iter().map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, outcome)) => slots[idx] = Some(outcome),
            Err(e) => error!(error = %e, "Step task aborted"),
        }
    }

    // A panicked task still yields a failed result slot.
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| {
                let (step_id, agent_id) = &ids[idx];
                let mut result = StepResult::pending(step_id, agent_id);
                result.status = StepStatus::Failed;
                result.error = Some("step task aborted".to_string());
                StepOutcome {
                    result,
                    logs: vec![LogEntry::error(Some(step_id), "Step task aborted")],
                }
            })
        })
        .collect()
}

/// Skip every step that has not reached a terminal status.
fn skip_unfinished(run: &mut WorkflowRun, reason: &str) {
    let mut skipped = 0usize;
    for result in &mut run.results {
        if !result.status.is_terminal() {
            result.skip(reason);
            skipped += 1;
        }
    }
    if skipped > 0 {
        run.log(LogEntry::info(
            None,
            format!("{skipped} step(s) skipped: {reason}"),
        ));
    }
}
