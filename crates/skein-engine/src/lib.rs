//! Workflow planning and orchestration.
//!
//! The engine takes a validated [`Workflow`](skein_model::Workflow), plans
//! its dependency levels, and drives a [`WorkflowRun`](skein_model::WorkflowRun)
//! to a terminal status: steps execute through an [`AgentInvoker`] with
//! per-step timeouts and retry backoff, failures resolve according to the
//! workflow's failure strategy, and every state change is checkpointed to a
//! [`RunStore`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use skein_engine::{EngineConfig, MemoryRunStore, MockAgent, OrchestrationEngine};
//! use skein_model::WorkflowFile;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let workflow = WorkflowFile::from_file("order_sync.toml")?.workflow;
//! let engine = OrchestrationEngine::new(
//!     Arc::new(MockAgent::new()),
//!     Arc::new(MemoryRunStore::new()),
//!     EngineConfig::default(),
//! );
//! let run = engine.execute(&workflow, "u-42", json!({"region": "eu"})).await?;
//! println!("{:?}", run.status);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod planner;
pub mod store;

pub use agent::{
    AgentInvocation, AgentInvoker, DryRunInvoker, MockAgent, MockResponse, SandboxedInvoker,
};
pub use context::RunContext;
pub use engine::{ActiveRunInfo, EngineConfig, OrchestrationEngine};
pub use error::{EngineError, EngineResult};
pub use executor::{StepExecutor, StepOutcome};
pub use planner::{ExecutionPlan, plan, transitive_dependents};
pub use store::{MemoryRunStore, MemoryWorkflowStore, RunStore, WorkflowStore};
