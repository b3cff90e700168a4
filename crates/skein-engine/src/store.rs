//! Run-state persistence.
//!
//! The engine checkpoints every run after each state change so observers
//! can follow progress and history survives the run itself. The store is a
//! seam: [`MemoryRunStore`] backs tests and single-process deployments,
//! and database-backed implementations plug in behind the same trait.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use skein_model::{Workflow, WorkflowRun};

use crate::error::EngineResult;

/// Persists workflow definitions.
///
/// Saving a workflow whose id already exists replaces the stored
/// definition; callers bump the version via
/// [`Workflow::next_version`](skein_model::Workflow::next_version) so runs
/// stay attributable to the definition they executed.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()>;

    async fn find_workflow(&self, workflow_id: &str) -> EngineResult<Option<Workflow>>;
}

/// Persists workflow runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or overwrite a run snapshot.
    async fn save_run(&self, run: &WorkflowRun) -> EngineResult<()>;

    /// Fetch a run by id.
    async fn find_run(&self, run_id: Uuid) -> EngineResult<Option<WorkflowRun>>;

    /// All runs owned by a user, newest first.
    async fn list_runs(&self, user_id: &str) -> EngineResult<Vec<WorkflowRun>>;
}

/// In-memory workflow store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save_workflow(&self, workflow: &Workflow) -> EngineResult<()> {
        self.workflows
            .write()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn find_workflow(&self, workflow_id: &str) -> EngineResult<Option<Workflow>> {
        Ok(self.workflows.read().get(workflow_id).cloned())
    }
}

/// In-memory run store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, run: &WorkflowRun) -> EngineResult<()> {
        self.runs.write().insert(run.run_id, run.clone());
        Ok(())
    }

    async fn find_run(&self, run_id: Uuid) -> EngineResult<Option<WorkflowRun>> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn list_runs(&self, user_id: &str) -> EngineResult<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
