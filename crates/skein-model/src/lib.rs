//! Workflow and run data model for Skein.
//!
//! Definitions (`Workflow`, `WorkflowStep`, `WorkflowConfig`) are immutable
//! once created and validated up front; their run-time counterparts
//! (`WorkflowRun`, `StepResult`, `LogEntry`) carry guarded state machines the
//! orchestration engine drives.

pub mod error;
pub mod run;
pub mod workflow;

pub use error::{ModelError, Result};
pub use run::{LogEntry, LogLevel, RunStatus, StepResult, StepStatus, WorkflowRun};
pub use workflow::{
    ExecutionStrategy, FailureStrategy, RetryPolicy, StepCondition, Workflow, WorkflowConfig,
    WorkflowFile, WorkflowStep,
};
