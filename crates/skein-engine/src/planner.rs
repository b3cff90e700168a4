//! Dependency-aware execution planning.
//!
//! Turns a workflow's step graph into an [`ExecutionPlan`]: an ordered list
//! of levels where every step's dependencies live in strictly earlier
//! levels. Steps inside a level are mutually independent and may run
//! concurrently; levels always complete as a barrier before the next starts.

use std::collections::HashSet;

use skein_model::{Workflow, WorkflowStep};

use crate::error::{EngineError, EngineResult};

/// Layered execution order for a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Step ids grouped by dependency depth, definition order within a level.
    pub levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Total number of planned steps.
    pub fn step_count(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    /// Flatten to a single sequential order. Levels stay in order and steps
    /// keep their definition order within a level, so the result is
    /// deterministic for a given workflow.
    pub fn flatten_sequential(&self) -> Vec<String> {
        self.levels.iter().flatten().cloned().collect()
    }
}

/// Compute the execution plan for a validated workflow.
///
/// Fails with [`EngineError::CyclicDependency`] when a dependency cycle
/// leaves steps that can never become ready; the error names the stuck
/// steps. No partial plan is produced.
pub fn plan(workflow: &Workflow) -> EngineResult<ExecutionPlan> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&WorkflowStep> = workflow.steps.iter().collect();
    let mut levels: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        // Ready = every dependency already placed in an earlier level.
        let (ready, blocked): (Vec<&WorkflowStep>, Vec<&WorkflowStep>) = remaining
            .into_iter()
            .partition(|step| step.depends_on.iter().all(|dep| placed.contains(dep.as_str())));

        if ready.is_empty() {
            let mut stuck: Vec<&str> = blocked.iter().map(|s| s.id.as_str()).collect();
            stuck.sort_unstable();
            return Err(EngineError::CyclicDependency(format!(
                "steps cannot be scheduled: {}",
                stuck.join(", ")
            )));
        }

        for step in &ready {
            placed.insert(step.id.as_str());
        }
        levels.push(ready.iter().map(|s| s.id.clone()).collect());
        remaining = blocked;
    }

    Ok(ExecutionPlan { levels })
}

/// Every step that transitively depends on `step_id`, directly or through
/// other steps. Used to skip downstream work after a failure.
pub fn transitive_dependents(workflow: &Workflow, step_id: &str) -> HashSet<String> {
    let mut dependents: HashSet<String> = HashSet::new();
    let mut frontier: Vec<&str> = vec![step_id];

    while let Some(current) = frontier.pop() {
        for step in &workflow.steps {
            if step.depends_on.iter().any(|d| d == current) && dependents.insert(step.id.clone()) {
                frontier.push(step.id.as_str());
            }
        }
    }
    dependents
}
