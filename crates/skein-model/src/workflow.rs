//! Declarative workflow definitions.
//!
//! A `Workflow` is an immutable-once-created list of steps plus an execution
//! policy. Definitions can be built programmatically or parsed from TOML
//! files, and are validated before any run is planned.
//!
//! # Example TOML
//!
//! ```toml
//! [workflow]
//! id = "order_sync"
//! name = "Order synchronization"
//! user_id = "u-42"
//!
//! [[workflow.steps]]
//! id = "fetch_orders"
//! agent_id = "http"
//! action = "get"
//! input = { url = "https://api.example.com/orders" }
//! timeout_seconds = 30
//! retry_count = 2
//!
//! [[workflow.steps]]
//! id = "store_orders"
//! agent_id = "database"
//! action = "insert"
//! input = { rows = "{{fetch_orders.body}}" }
//! depends_on = ["fetch_orders"]
//!
//! [workflow.config]
//! execution_strategy = "parallel"
//! max_parallel_steps = 4
//! failure_strategy = "stop"
//! timeout_minutes = 30
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ModelError;

/// How steps within a level are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One step at a time, in definition order.
    #[default]
    Sequential,
    /// Steps within a level run concurrently, bounded by `max_parallel_steps`.
    Parallel,
}

/// What happens to the run when a step fails after retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Fail the run immediately; un-dispatched steps are skipped.
    #[default]
    Stop,
    /// Keep going; only steps depending on the failure are skipped.
    Continue,
}

/// Retry backoff policy applied to every step in the run.
///
/// The wait before attempt `n` (zero-based) is
/// `initial_delay_ms * backoff_factor^n`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Ceiling on any single backoff wait, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff wait before retrying after the given zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

/// Execution policy for a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Sequential or parallel dispatch.
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    /// Worker pool size for parallel levels.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Stop or continue on step failure.
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Retry backoff shared by all steps.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Whole-run ceiling, independent of per-step timeouts.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_timeout_minutes() -> u64 {
    60
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            execution_strategy: ExecutionStrategy::default(),
            max_parallel_steps: default_max_parallel_steps(),
            failure_strategy: FailureStrategy::default(),
            retry_policy: RetryPolicy::default(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

/// A skip predicate evaluated against prior step results.
///
/// Conditions are explicit typed expressions over a dot path, not free-form
/// string interpolation. Paths use the same syntax as input placeholders:
/// `step_id.field`, `step_id.items[0].name`, or `input.field`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    /// Run the step only if the value at `path` equals `value`.
    Equals { path: String, value: Value },
    /// Run the step only if the value at `path` differs from `value`.
    NotEquals { path: String, value: Value },
    /// Run the step only if `path` resolves to any value.
    Exists { path: String },
    /// Run the step only if `path` resolves to a truthy value
    /// (non-null, non-false, non-zero, non-empty string).
    Truthy { path: String },
}

/// One unit of work delegating to an agent capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowStep {
    /// Unique step identifier within this workflow.
    pub id: String,

    /// Agent that provides the capability (e.g., "http", "database").
    pub agent_id: String,

    /// Agent version pin.
    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    /// Capability name on the agent (e.g., "get", "insert", "send_message").
    pub action: String,

    /// Input map passed to the agent. String values may reference prior
    /// step outputs via `{{step_id.field}}` placeholders.
    #[serde(default = "empty_object")]
    pub input: Value,

    /// Ids of steps that must complete before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Hard deadline for a single attempt, in seconds. Must be > 0.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Number of retries after the first failed attempt.
    #[serde(default)]
    pub retry_count: u32,

    /// Optional skip predicate; false means the step is skipped.
    #[serde(default)]
    pub condition: Option<StepCondition>,
}

fn default_agent_version() -> String {
    "latest".to_string()
}

fn default_timeout_seconds() -> u64 {
    60
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A reusable workflow definition: ordered steps plus execution policy.
///
/// Identity is immutable once created. Edits produce a new `version` so
/// run history stays attributable to the definition it executed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workflow {
    /// Stable workflow identifier.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: String,

    /// Definition version, bumped on every edit.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Owning user.
    pub user_id: String,

    /// Ordered list of steps.
    pub steps: Vec<WorkflowStep>,

    /// Execution policy.
    #[serde(default)]
    pub config: WorkflowConfig,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    /// Create a workflow with a fresh id and default config.
    pub fn new(name: impl Into<String>, user_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: format!("wf-{}", Uuid::new_v4()),
            name: name.into(),
            description: String::new(),
            version: 1,
            user_id: user_id.into(),
            steps,
            config: WorkflowConfig::default(),
        }
    }

    /// Validate the definition.
    ///
    /// Checks:
    /// - Non-empty name and step list
    /// - Non-empty, unique step ids
    /// - All `depends_on` references point to existing steps
    /// - No cycles in the dependency graph
    /// - Every per-step timeout is positive
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.is_empty() {
            return Err(ModelError::InvalidWorkflow(
                "Workflow name cannot be empty".into(),
            ));
        }

        if self.steps.is_empty() {
            return Err(ModelError::InvalidWorkflow(
                "Workflow must have at least one step".into(),
            ));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(ModelError::InvalidWorkflow(
                    "Step id cannot be empty".into(),
                ));
            }
            if !seen_ids.insert(step.id.as_str()) {
                return Err(ModelError::InvalidWorkflow(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if step.timeout_seconds == 0 {
                return Err(ModelError::InvalidWorkflow(format!(
                    "Step '{}' has a zero timeout",
                    step.id
                )));
            }
            for dep in &step.depends_on {
                if !seen_ids.contains(dep.as_str()) {
                    return Err(ModelError::InvalidWorkflow(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    /// Detect cycles in the step dependency graph using Kahn's algorithm.
    fn detect_cycles(&self) -> Result<(), ModelError> {
        let step_ids: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let id_to_idx: HashMap<&str, usize> = step_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let n = step_ids.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

        for step in &self.steps {
            let idx = id_to_idx[step.id.as_str()];
            for dep in &step.depends_on {
                let dep_idx = id_to_idx[dep.as_str()];
                adj[dep_idx].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(node) = queue.pop() {
            visited += 1;
            for &neighbor in &adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push(neighbor);
                }
            }
        }

        if visited != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| step_ids[i])
                .collect();
            return Err(ModelError::CyclicDependency(format!(
                "steps [{}] form a cycle",
                stuck.join(", ")
            )));
        }

        Ok(())
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Produce an edited copy with a bumped version.
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Top-level wrapper matching the TOML structure `[workflow]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub workflow: Workflow,
}

impl WorkflowFile {
    /// Parse a workflow definition from a TOML string and validate it.
    pub fn from_toml(toml_str: &str) -> Result<Self, ModelError> {
        let file: WorkflowFile = toml::from_str(toml_str)
            .map_err(|e| ModelError::InvalidWorkflow(format!("TOML parse error: {e}")))?;
        file.workflow.validate()?;
        Ok(file)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModelError::InvalidWorkflow(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID_WORKFLOW: &str = r#"
[workflow]
id = "wf-1"
name = "test workflow"
user_id = "u-1"

[[workflow.steps]]
id = "step_a"
agent_id = "http"
action = "get"

[[workflow.steps]]
id = "step_b"
agent_id = "database"
action = "insert"
depends_on = ["step_a"]
timeout_seconds = 30
retry_count = 2

[workflow.config]
execution_strategy = "parallel"
max_parallel_steps = 2
failure_strategy = "continue"
timeout_minutes = 15
"#;

    pub(crate) fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.into(),
            agent_id: "mock".into(),
            agent_version: "latest".into(),
            action: "echo".into(),
            input: json!({}),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout_seconds: 10,
            retry_count: 0,
            condition: None,
        }
    }

    pub(crate) fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: "wf-1".into(),
            name: "test".into(),
            description: String::new(),
            version: 1,
            user_id: "u-1".into(),
            steps,
            config: WorkflowConfig::default(),
        }
    }

    #[test]
    fn test_parse_valid_workflow() {
        let wf = WorkflowFile::from_toml(VALID_WORKFLOW).unwrap();
        assert_eq!(wf.workflow.id, "wf-1");
        assert_eq!(wf.workflow.steps.len(), 2);
        assert_eq!(wf.workflow.steps[1].depends_on, vec!["step_a"]);
        assert_eq!(wf.workflow.steps[1].timeout_seconds, 30);
        assert_eq!(wf.workflow.steps[1].retry_count, 2);
        assert_eq!(
            wf.workflow.config.execution_strategy,
            ExecutionStrategy::Parallel
        );
        assert_eq!(wf.workflow.config.failure_strategy, FailureStrategy::Continue);
        assert_eq!(wf.workflow.config.timeout_minutes, 15);
    }

    #[test]
    fn test_parse_defaults() {
        let toml = r#"
[workflow]
id = "wf-min"
name = "minimal"
user_id = "u-1"

[[workflow.steps]]
id = "only"
agent_id = "mock"
action = "noop"
"#;
        let wf = WorkflowFile::from_toml(toml).unwrap().workflow;
        assert_eq!(wf.version, 1);
        assert_eq!(wf.steps[0].agent_version, "latest");
        assert_eq!(wf.steps[0].timeout_seconds, 60);
        assert_eq!(wf.steps[0].retry_count, 0);
        assert!(wf.steps[0].input.as_object().unwrap().is_empty());
        assert_eq!(wf.config.execution_strategy, ExecutionStrategy::Sequential);
        assert_eq!(wf.config.max_parallel_steps, 4);
        assert_eq!(wf.config.timeout_minutes, 60);
    }

    #[test]
    fn test_parse_condition() {
        let toml = r#"
[workflow]
id = "wf-c"
name = "conditional"
user_id = "u-1"

[[workflow.steps]]
id = "gate"
agent_id = "mock"
action = "check"

[[workflow.steps]]
id = "guarded"
agent_id = "mock"
action = "run"
depends_on = ["gate"]
condition = { type = "equals", path = "gate.passed", value = true }
"#;
        let wf = WorkflowFile::from_toml(toml).unwrap().workflow;
        match wf.steps[1].condition.as_ref().unwrap() {
            StepCondition::Equals { path, value } => {
                assert_eq!(path, "gate.passed");
                assert_eq!(value, &json!(true));
            }
            other => panic!("Expected Equals condition, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_empty_name() {
        let mut wf = workflow(vec![step("a", &[])]);
        wf.name.clear();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_validate_no_steps() {
        let wf = workflow(vec![]);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validate_duplicate_step_ids() {
        let wf = workflow(vec![step("dup", &[]), step("dup", &[])]);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate step id"));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let wf = workflow(vec![step("a", &["ghost"])]);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut s = step("a", &[]);
        s.timeout_seconds = 0;
        let wf = workflow(vec![s]);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("zero timeout"));
    }

    #[test]
    fn test_validate_cycle() {
        let wf = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, ModelError::CyclicDependency(_)));
    }

    #[test]
    fn test_validate_self_cycle() {
        let wf = workflow(vec![step("a", &["a"])]);
        assert!(matches!(
            wf.validate().unwrap_err(),
            ModelError::CyclicDependency(_)
        ));
    }

    #[test]
    fn test_validate_diamond_dag() {
        let wf = workflow(vec![
            step("start", &[]),
            step("left", &["start"]),
            step("right", &["start"]),
            step("join", &["left", "right"]),
        ]);
        wf.validate().unwrap();
    }

    #[test]
    fn test_next_version_bumps() {
        let wf = workflow(vec![step("a", &[])]);
        let v2 = wf.next_version();
        assert_eq!(wf.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.id, wf.id);
    }

    #[test]
    fn test_step_lookup() {
        let wf = workflow(vec![step("a", &[]), step("b", &["a"])]);
        assert_eq!(wf.step("b").unwrap().depends_on, vec!["a"]);
        assert!(wf.step("missing").is_none());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 200);
        // 400 would exceed the cap
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 350);
        assert_eq!(policy.delay_for_attempt(10).as_millis(), 350);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.toml");
        std::fs::write(&path, VALID_WORKFLOW).unwrap();
        let wf = WorkflowFile::from_file(&path).unwrap();
        assert_eq!(wf.workflow.steps.len(), 2);

        // Anything path-like works, including a plain &str.
        let wf = WorkflowFile::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(wf.workflow.name, "test workflow");
    }

    #[test]
    fn test_from_toml_rejects_invalid_graph() {
        let toml = r#"
[workflow]
id = "wf-cyc"
name = "cyclic"
user_id = "u-1"

[[workflow.steps]]
id = "a"
agent_id = "mock"
action = "x"
depends_on = ["b"]

[[workflow.steps]]
id = "b"
agent_id = "mock"
action = "x"
depends_on = ["a"]
"#;
        assert!(matches!(
            WorkflowFile::from_toml(toml).unwrap_err(),
            ModelError::CyclicDependency(_)
        ));
    }

    #[test]
    fn test_invalid_toml_syntax() {
        assert!(WorkflowFile::from_toml("not valid toml {{{").is_err());
    }
}
