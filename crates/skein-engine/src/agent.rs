//! Agent invocation seam.
//!
//! The engine never talks to agents directly; it hands an
//! [`AgentInvocation`] to an [`AgentInvoker`]. Production deployments use
//! [`SandboxedInvoker`], which executes every capability inside an isolated
//! workspace. [`MockAgent`] gives tests deterministic, scriptable agents,
//! and [`DryRunInvoker`] backs validation-only runs that touch nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use skein_sandbox::{SandboxManager, SandboxRequest, SandboxSpec, SandboxStatus};

use crate::error::{EngineError, EngineResult};

/// Everything an invoker needs to execute one step attempt.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent_id: String,
    pub agent_version: String,
    pub action: String,
    /// Input with all placeholders already resolved.
    pub input: Value,
    pub run_id: Uuid,
    pub step_id: String,
    /// Per-attempt deadline; invokers must not outlive it.
    pub timeout: Duration,
    /// Opaque reference to a stored credential. Invokers pass it through to
    /// the agent runtime; the engine never sees secret material.
    pub credential_ref: Option<String>,
}

/// Executes agent capabilities on behalf of the engine.
///
/// Implementations must respect `cancel` (return promptly once it fires)
/// and should finish within `invocation.timeout`; the executor enforces the
/// deadline regardless.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> EngineResult<Value>;
}

// ---------------------------------------------------------------------------
// Sandboxed invoker
// ---------------------------------------------------------------------------

/// Production invoker: every capability runs in an isolated sandbox.
pub struct SandboxedInvoker {
    manager: Arc<SandboxManager>,
    /// Base quota applied to every invocation; the per-attempt timeout
    /// always comes from the invocation itself.
    base_spec: SandboxSpec,
}

impl SandboxedInvoker {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            base_spec: SandboxSpec::default(),
        }
    }

    pub fn with_base_spec(mut self, spec: SandboxSpec) -> Self {
        self.base_spec = spec;
        self
    }
}

#[async_trait]
impl AgentInvoker for SandboxedInvoker {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> EngineResult<Value> {
        let mut spec = self.base_spec.clone().with_timeout(invocation.timeout);
        if let Some(credential_ref) = &invocation.credential_ref {
            spec = spec.add_env("AGENT_CREDENTIAL_REF", credential_ref);
        }

        let request = SandboxRequest {
            agent_id: invocation.agent_id.clone(),
            run_id: Some(invocation.run_id),
            step_id: Some(invocation.step_id.clone()),
            action: invocation.action.clone(),
            input: invocation.input.clone(),
            spec,
            mock: None,
            cancel: Some(cancel.clone()),
        };

        // Detached task: if this future is dropped at the step deadline, the
        // sandbox still runs to its own (equal) deadline and cleans up.
        let manager = Arc::clone(&self.manager);
        let handle = tokio::spawn(async move { manager.execute(&request).await });
        let report = handle
            .await
            .map_err(|e| EngineError::AgentFailed {
                agent_id: invocation.agent_id.clone(),
                message: format!("sandbox task aborted: {e}"),
            })??;

        match report.status {
            SandboxStatus::Completed => Ok(report
                .result
                .and_then(|doc| doc.output)
                .unwrap_or(Value::Null)),
            _ => Err(EngineError::AgentFailed {
                agent_id: invocation.agent_id.clone(),
                message: report
                    .failure_reason
                    .unwrap_or_else(|| "sandbox execution failed".to_string()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dry-run invoker
// ---------------------------------------------------------------------------

/// Simulates every invocation without side effects. The output mirrors the
/// resolved input so downstream placeholders still resolve.
pub struct DryRunInvoker;

#[async_trait]
impl AgentInvoker for DryRunInvoker {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        _cancel: &CancellationToken,
    ) -> EngineResult<Value> {
        debug!(
            step_id = %invocation.step_id,
            agent_id = %invocation.agent_id,
            action = %invocation.action,
            "Dry-run invocation"
        );
        Ok(json!({
            "dry_run": true,
            "agent_id": invocation.agent_id,
            "action": invocation.action,
            "input": invocation.input,
        }))
    }
}

// ---------------------------------------------------------------------------
// Mock agent
// ---------------------------------------------------------------------------

/// Scripted response for one action.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return the invocation input unchanged.
    Echo,
    /// Return a fixed value.
    Value(Value),
    /// Fail every attempt.
    Fail(String),
    /// Fail the first `n` attempts, then echo the input.
    FailTimes(u32),
    /// Sleep, honoring cancellation, then echo. For timeout tests.
    Sleep(Duration),
}

/// Deterministic in-process agent for tests: responses are keyed by action.
#[derive(Default)]
pub struct MockAgent {
    responses: Mutex<HashMap<String, MockResponse>>,
    /// Attempt counts keyed by `"step_id/action"`.
    attempts: Mutex<HashMap<String, u32>>,
    /// Invocation order as `"step_id:action"`, for assertions.
    calls: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, action: impl Into<String>, response: MockResponse) -> Self {
        self.responses.lock().insert(action.into(), response);
        self
    }

    /// Invocations seen so far, in dispatch order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentInvoker for MockAgent {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> EngineResult<Value> {
        self.calls
            .lock()
            .push(format!("{}:{}", invocation.step_id, invocation.action));

        let attempt = {
            let mut attempts = self.attempts.lock();
            let key = format!("{}/{}", invocation.step_id, invocation.action);
            let counter = attempts.entry(key).or_insert(0);
            *counter += 1;
            *counter
        };

        let response = self
            .responses
            .lock()
            .get(&invocation.action)
            .cloned()
            .unwrap_or(MockResponse::Echo);

        match response {
            MockResponse::Echo => Ok(invocation.input.clone()),
            MockResponse::Value(v) => Ok(v),
            MockResponse::Fail(message) => Err(EngineError::AgentFailed {
                agent_id: invocation.agent_id.clone(),
                message,
            }),
            MockResponse::FailTimes(n) if attempt <= n => Err(EngineError::AgentFailed {
                agent_id: invocation.agent_id.clone(),
                message: format!("transient failure on attempt {attempt}"),
            }),
            MockResponse::FailTimes(_) => Ok(invocation.input.clone()),
            MockResponse::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(invocation.input.clone()),
                    _ = cancel.cancelled() => Err(EngineError::AgentFailed {
                        agent_id: invocation.agent_id.clone(),
                        message: "invocation cancelled".to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(step_id: &str, action: &str) -> AgentInvocation {
        AgentInvocation {
            agent_id: "mock".into(),
            agent_version: "latest".into(),
            action: action.into(),
            input: json!({"k": 1}),
            run_id: Uuid::new_v4(),
            step_id: step_id.into(),
            timeout: Duration::from_secs(5),
            credential_ref: None,
        }
    }

    #[tokio::test]
    async fn test_mock_echo_by_default() {
        let agent = MockAgent::new();
        let out = agent
            .invoke(&invocation("a", "anything"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"k": 1}));
        assert_eq!(agent.calls(), vec!["a:anything"]);
    }

    #[tokio::test]
    async fn test_mock_scripted_value_and_failure() {
        let agent = MockAgent::new()
            .with_response("get", MockResponse::Value(json!({"rows": 3})))
            .with_response("boom", MockResponse::Fail("nope".into()));

        let out = agent
            .invoke(&invocation("a", "get"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"rows": 3}));

        let err = agent
            .invoke(&invocation("b", "boom"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AgentFailed { .. }));
    }

    #[tokio::test]
    async fn test_mock_fail_times_then_succeeds() {
        let agent = MockAgent::new().with_response("flaky", MockResponse::FailTimes(2));
        let cancel = CancellationToken::new();

        assert!(agent.invoke(&invocation("s", "flaky"), &cancel).await.is_err());
        assert!(agent.invoke(&invocation("s", "flaky"), &cancel).await.is_err());
        let out = agent.invoke(&invocation("s", "flaky"), &cancel).await.unwrap();
        assert_eq!(out, json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_mock_attempts_tracked_per_step() {
        let agent = MockAgent::new().with_response("flaky", MockResponse::FailTimes(1));
        let cancel = CancellationToken::new();

        // Each step gets its own attempt counter.
        assert!(agent.invoke(&invocation("s1", "flaky"), &cancel).await.is_err());
        assert!(agent.invoke(&invocation("s2", "flaky"), &cancel).await.is_err());
        assert!(agent.invoke(&invocation("s1", "flaky"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_sleep_cancellable() {
        let agent = MockAgent::new()
            .with_response("hang", MockResponse::Sleep(Duration::from_secs(600)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent
            .invoke(&invocation("s", "hang"), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_dry_run_mirrors_input() {
        let out = DryRunInvoker
            .invoke(&invocation("s", "get"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["dry_run"], json!(true));
        assert_eq!(out["action"], json!("get"));
        assert_eq!(out["input"], json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_sandboxed_invoker_success() {
        use skein_sandbox::{ManagerConfig, MockBackend};

        let manager = Arc::new(SandboxManager::new(
            Arc::new(MockBackend::new()),
            ManagerConfig::default(),
        ));
        let invoker = SandboxedInvoker::new(Arc::clone(&manager));

        let out = invoker
            .invoke(&invocation("s", "get"), &CancellationToken::new())
            .await
            .unwrap();
        // Mock backend echoes the payload input.
        assert_eq!(out, json!({"k": 1}));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sandboxed_invoker_failure_maps_to_agent_failed() {
        use skein_sandbox::{ManagerConfig, MockBackend, MockBehavior};

        let manager = Arc::new(SandboxManager::new(
            Arc::new(MockBackend::new().with_behavior("boom", MockBehavior::Fail("bad".into()))),
            ManagerConfig::default(),
        ));
        let invoker = SandboxedInvoker::new(manager);

        let err = invoker
            .invoke(&invocation("s", "boom"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::AgentFailed { agent_id, message } => {
                assert_eq!(agent_id, "mock");
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
