//! Error types for planning and orchestration.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] skein_model::ModelError),

    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("Unresolved reference '{{{reference}}}' in step '{step_id}'")]
    UnresolvedReference { step_id: String, reference: String },

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Engine at capacity: {active} active runs (max {max})")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Agent '{agent_id}' failed: {message}")]
    AgentFailed { agent_id: String, message: String },

    #[error(transparent)]
    Sandbox(#[from] skein_sandbox::SandboxError),
}

pub type EngineResult<T> = Result<T, EngineError>;
