//! Error types for the workflow data model.

use thiserror::Error;

use crate::run::RunStatus;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while building or mutating model types.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid workflow definition (empty steps, duplicate ids, bad references).
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// The step dependency graph contains a cycle.
    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    /// Illegal run state transition.
    #[error("Invalid run transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}
