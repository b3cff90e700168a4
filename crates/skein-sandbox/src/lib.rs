//! Isolated execution environments for agent capabilities.
//!
//! Each invocation gets a private temporary workspace, a resource quota
//! (memory, CPU, wall clock), and no network access unless domains are
//! explicitly allowed. Communication with the sandboxed process happens
//! through two fixed-location JSON documents in the workspace: `payload.json`
//! (written before launch) and `result.json` (written by the payload).
//!
//! [`SandboxManager`] is the entry point; [`ExecutionBackend`] abstracts how
//! the process actually runs, with [`ProcessBackend`] using OS-level
//! isolation (bubblewrap on Linux, Seatbelt on macOS) and [`MockBackend`]
//! simulating executions for tests.

pub mod backend;
pub mod error;
pub mod manager;
pub mod payload;
pub mod platform;
pub mod spec;

pub use backend::{BackendOutput, ExecutionBackend, MockBackend, MockBehavior, ProcessBackend};
pub use error::{SandboxError, SandboxResult};
pub use manager::{
    ActiveSandboxInfo, ExecutionReport, SandboxManager, SandboxRequest, SandboxStatus,
};
pub use payload::{PAYLOAD_FILE, RESULT_FILE, ResourceUsage, ResultDocument, SandboxPayload};
pub use platform::{Platform, SandboxSupport};
pub use spec::{ManagerConfig, SandboxSpec};
