//! Sandbox lifecycle management.
//!
//! `SandboxManager` owns the active-sandbox registry shared across all
//! concurrent workflow runs. Every invocation walks the same lifecycle:
//! `create` (capacity check, workspace + payload materialization) →
//! `run` (backend execution under the deadline, artifact extraction) →
//! `cleanup` (kill, workspace deletion, registry removal). Cleanup happens
//! on every outcome; no sandbox outlives its invocation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendOutput, ExecutionBackend};
use crate::error::{SandboxError, SandboxResult};
use crate::payload::{PAYLOAD_FILE, RESULT_FILE, ResourceUsage, ResultDocument, SandboxPayload};
use crate::spec::{ManagerConfig, SandboxSpec};

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Created,
    Running,
    Completed,
    Timeout,
    Error,
}

/// A request to execute one payload in isolation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Agent whose capability is being executed.
    pub agent_id: String,
    /// Owning run, when invoked by the orchestrator.
    pub run_id: Option<Uuid>,
    /// Owning step, when invoked by the orchestrator.
    pub step_id: Option<String>,
    /// Capability name.
    pub action: String,
    /// Input data for the capability.
    pub input: serde_json::Value,
    /// Resource quota and isolation settings.
    pub spec: SandboxSpec,
    /// Optional mock configuration forwarded into the payload.
    pub mock: Option<serde_json::Value>,
    /// Parent cancellation scope; the sandbox gets a child token so an
    /// upstream cancel tears it down without affecting siblings.
    pub cancel: Option<CancellationToken>,
}

impl SandboxRequest {
    /// An ad-hoc request not tied to a workflow run.
    pub fn adhoc(agent_id: impl Into<String>, action: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            run_id: None,
            step_id: None,
            action: action.into(),
            input,
            spec: SandboxSpec::default(),
            mock: None,
            cancel: None,
        }
    }

    pub fn with_spec(mut self, spec: SandboxSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Final report of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    /// Exit code; `None` when the process was killed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Structured result artifact, when present and parseable.
    pub result: Option<ResultDocument>,
    /// Why the execution did not complete cleanly, when it didn't.
    pub failure_reason: Option<String>,
    pub usage: ResourceUsage,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    /// True when the payload completed and reported success.
    pub fn succeeded(&self) -> bool {
        self.status == SandboxStatus::Completed
    }
}

/// Read-only view of an active sandbox, for observability tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSandboxInfo {
    pub sandbox_id: String,
    pub agent_id: String,
    pub run_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    /// Filesystem handle to the sandbox's private workspace.
    pub workspace: PathBuf,
}

/// Registry entry owning the sandbox's workspace and cancellation handle.
struct ActiveSandbox {
    agent_id: String,
    run_id: Option<Uuid>,
    step_id: Option<String>,
    status: SandboxStatus,
    created_at: DateTime<Utc>,
    spec: SandboxSpec,
    cancel: CancellationToken,
    /// RAII workspace; dropping the entry deletes it.
    workspace: TempDir,
}

/// Creates, runs, and tears down isolated executions.
pub struct SandboxManager {
    backend: Arc<dyn ExecutionBackend>,
    config: ManagerConfig,
    active: Mutex<HashMap<String, ActiveSandbox>>,
}

impl SandboxManager {
    /// Create a manager over the given execution backend.
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: ManagerConfig) -> Self {
        Self {
            backend,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create a sandbox: capacity check, private workspace, payload document.
    ///
    /// Returns the sandbox id. The caller must eventually invoke
    /// [`cleanup`](Self::cleanup); prefer [`execute`](Self::execute), which
    /// guarantees it.
    pub fn create(&self, request: &SandboxRequest) -> SandboxResult<String> {
        {
            let active = self.active.lock();
            if active.len() >= self.config.max_active {
                return Err(SandboxError::CapacityExceeded {
                    active: active.len(),
                    max: self.config.max_active,
                });
            }
        }

        let workspace = match &self.config.root_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                TempDir::with_prefix_in("sbx-", root)?
            }
            None => TempDir::with_prefix("sbx-")?,
        };

        let payload = SandboxPayload {
            action: request.action.clone(),
            input: request.input.clone(),
            allowed_domains: request.spec.allowed_domains.clone(),
            timeout_secs: request.spec.timeout.as_secs(),
            env: request.spec.env.iter().cloned().collect(),
            mock: request.mock.clone(),
        };
        let serialized = serde_json::to_string_pretty(&payload)
            .map_err(|e| SandboxError::Payload(format!("cannot serialize payload: {e}")))?;
        std::fs::write(workspace.path().join(PAYLOAD_FILE), serialized)?;

        let sandbox_id = format!("sbx-{}", Uuid::new_v4());
        let entry = ActiveSandbox {
            agent_id: request.agent_id.clone(),
            run_id: request.run_id,
            step_id: request.step_id.clone(),
            status: SandboxStatus::Created,
            created_at: Utc::now(),
            spec: request.spec.clone(),
            cancel: request
                .cancel
                .as_ref()
                .map(CancellationToken::child_token)
                .unwrap_or_default(),
            workspace,
        };

        {
            let mut active = self.active.lock();
            // Ceiling re-checked under the same lock as the insert.
            if active.len() >= self.config.max_active {
                return Err(SandboxError::CapacityExceeded {
                    active: active.len(),
                    max: self.config.max_active,
                });
            }
            active.insert(sandbox_id.clone(), entry);
        }

        debug!(sandbox_id = %sandbox_id, agent_id = %request.agent_id, "Sandbox created");
        Ok(sandbox_id)
    }

    /// Run a created sandbox to completion, timeout, or error.
    ///
    /// Does not clean up; pair with [`cleanup`](Self::cleanup) on every path.
    pub async fn run(&self, sandbox_id: &str) -> SandboxResult<ExecutionReport> {
        let (workspace_path, spec, cancel) = {
            let mut active = self.active.lock();
            let entry = active
                .get_mut(sandbox_id)
                .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
            entry.status = SandboxStatus::Running;
            (
                entry.workspace.path().to_path_buf(),
                entry.spec.clone(),
                entry.cancel.clone(),
            )
        };

        let started = Instant::now();
        let output = self.backend.execute(&workspace_path, &spec, &cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let report = match output {
            Ok(output) => self.build_report(sandbox_id, &workspace_path, output, elapsed_ms),
            Err(e) => {
                // Backend failure still yields a report so callers see logs.
                ExecutionReport {
                    sandbox_id: sandbox_id.to_string(),
                    status: SandboxStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    result: None,
                    failure_reason: Some(e.to_string()),
                    usage: ResourceUsage::default(),
                    elapsed_ms,
                }
            }
        };

        if let Some(entry) = self.active.lock().get_mut(sandbox_id) {
            entry.status = report.status;
        }

        info!(
            sandbox_id = %sandbox_id,
            status = ?report.status,
            exit_code = ?report.exit_code,
            elapsed_ms,
            "Sandbox finished"
        );
        Ok(report)
    }

    /// Map a raw backend output to a report, extracting the result artifact.
    fn build_report(
        &self,
        sandbox_id: &str,
        workspace: &std::path::Path,
        output: BackendOutput,
        elapsed_ms: u64,
    ) -> ExecutionReport {
        let (result, artifact_problem) = read_result_document(workspace);

        let (status, failure_reason) = if output.timed_out {
            (
                SandboxStatus::Timeout,
                Some("execution timed out".to_string()),
            )
        } else if output.cancelled {
            (SandboxStatus::Error, Some("execution cancelled".to_string()))
        } else {
            match output.exit_code {
                Some(0) => match (&result, &artifact_problem) {
                    (Some(doc), _) if doc.is_ok() => (SandboxStatus::Completed, None),
                    (Some(doc), _) => (
                        SandboxStatus::Error,
                        Some(
                            doc.error
                                .clone()
                                .unwrap_or_else(|| "payload reported an error".to_string()),
                        ),
                    ),
                    // Exit 0 with no artifact is still an error; say why.
                    (None, Some(problem)) => (SandboxStatus::Error, Some(problem.clone())),
                    (None, None) => (
                        SandboxStatus::Error,
                        Some("result document missing".to_string()),
                    ),
                },
                Some(code) => {
                    let reason = result
                        .as_ref()
                        .and_then(|d| d.error.clone())
                        .unwrap_or_else(|| format!("process exited with code {code}"));
                    (SandboxStatus::Error, Some(reason))
                }
                None => (
                    SandboxStatus::Error,
                    Some("process killed before exit".to_string()),
                ),
            }
        };

        ExecutionReport {
            sandbox_id: sandbox_id.to_string(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            result,
            failure_reason,
            usage: output.usage,
            elapsed_ms,
        }
    }

    /// Tear down a sandbox: kill, delete workspace, drop registry entry.
    ///
    /// Idempotent; cleaning an unknown id is a no-op.
    pub fn cleanup(&self, sandbox_id: &str) {
        let entry = self.active.lock().remove(sandbox_id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            // TempDir drop removes the workspace.
            debug!(sandbox_id = %sandbox_id, "Sandbox cleaned up");
        }
    }

    /// Create, run, and clean up in one call. Cleanup is guaranteed on every
    /// outcome, including create/run errors.
    pub async fn execute(&self, request: &SandboxRequest) -> SandboxResult<ExecutionReport> {
        let sandbox_id = self.create(request)?;
        let result = self.run(&sandbox_id).await;
        self.cleanup(&sandbox_id);
        result
    }

    /// Number of currently active sandboxes.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot of all active sandboxes, for admin tooling.
    pub fn active_sandboxes(&self) -> Vec<ActiveSandboxInfo> {
        self.active
            .lock()
            .iter()
            .map(|(id, entry)| ActiveSandboxInfo {
                sandbox_id: id.clone(),
                agent_id: entry.agent_id.clone(),
                run_id: entry.run_id,
                step_id: entry.step_id.clone(),
                status: entry.status,
                created_at: entry.created_at,
                workspace: entry.workspace.path().to_path_buf(),
            })
            .collect()
    }

    /// Force-clean every sandbox older than the configured age ceiling.
    ///
    /// Returns the ids reaped. Normally invoked by the background reaper,
    /// guarding against leaked resources from crashed callers.
    pub fn reap_expired(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.reap_after)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let expired: Vec<String> = self
            .active
            .lock()
            .iter()
            .filter(|(_, entry)| entry.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            warn!(sandbox_id = %id, "Reaping expired sandbox");
            self.cleanup(id);
        }
        expired
    }

    /// Spawn the periodic reaper task. The task runs until the caller
    /// aborts it through the returned handle; dropping the handle detaches
    /// the task, which then lives as long as the runtime.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.reap_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let reaped = manager.reap_expired();
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Reaper cleaned expired sandboxes");
                }
            }
        })
    }
}

/// Read and parse the result artifact, reporting why it is unusable if so.
fn read_result_document(
    workspace: &std::path::Path,
) -> (Option<ResultDocument>, Option<String>) {
    let path = workspace.join(RESULT_FILE);
    if !path.exists() {
        return (None, Some("result document missing".to_string()));
    }
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<ResultDocument>(&raw) {
            Ok(doc) => (Some(doc), None),
            Err(e) => (None, Some(format!("result document malformed: {e}"))),
        },
        Err(e) => (None, Some(format!("result document unreadable: {e}"))),
    }
}
