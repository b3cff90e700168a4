//! Run-scoped placeholder resolution and condition evaluation.
//!
//! Step inputs may embed `{{expression}}` placeholders that pull data from
//! the run input (`{{input.field}}`) or from the output of a completed
//! upstream step (`{{step_id.field}}`, `{{step_id.items[0].name}}`).
//!
//! A string that is exactly one placeholder resolves to the referenced JSON
//! value with its type preserved; a string mixing text and placeholders
//! resolves to a string with every placeholder stringified in place.

use std::collections::HashMap;

use serde_json::Value;
use skein_model::{StepCondition, WorkflowRun};

use crate::error::{EngineError, EngineResult};

/// Resolution scope for one step: run input plus completed upstream outputs.
pub struct RunContext {
    roots: HashMap<String, Value>,
}

impl RunContext {
    /// Build the scope from a run's input and its completed step results.
    ///
    /// Only steps that completed successfully contribute a root; a skipped
    /// or failed step's id stays unresolvable.
    pub fn for_run(run: &WorkflowRun) -> Self {
        let mut roots = HashMap::new();
        roots.insert("input".to_string(), run.input.clone());
        for result in &run.results {
            if result.status == skein_model::StepStatus::Completed
                && let Some(output) = &result.output
            {
                roots.insert(result.step_id.clone(), output.clone());
            }
        }
        Self { roots }
    }

    #[cfg(test)]
    fn from_roots(roots: HashMap<String, Value>) -> Self {
        Self { roots }
    }

    /// Resolve every placeholder in a step's input tree.
    ///
    /// `step_id` is the step being prepared; it appears in errors so run
    /// logs can attribute the unresolvable reference.
    pub fn resolve_input(&self, step_id: &str, input: &Value) -> EngineResult<Value> {
        match input {
            Value::String(s) => self.resolve_string(step_id, s),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_input(step_id, v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_input(step_id, v))
                .collect::<EngineResult<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, step_id: &str, s: &str) -> EngineResult<Value> {
        let placeholders = find_placeholders(s);
        if placeholders.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        // A sole placeholder spanning the whole string keeps its JSON type.
        if placeholders.len() == 1 && placeholders[0].raw == s {
            return self.lookup(&placeholders[0].path).cloned().ok_or_else(|| {
                EngineError::UnresolvedReference {
                    step_id: step_id.to_string(),
                    reference: placeholders[0].path.clone(),
                }
            });
        }

        let mut rendered = s.to_string();
        for ph in &placeholders {
            let value =
                self.lookup(&ph.path)
                    .ok_or_else(|| EngineError::UnresolvedReference {
                        step_id: step_id.to_string(),
                        reference: ph.path.clone(),
                    })?;
            rendered = rendered.replace(&ph.raw, &stringify(value));
        }
        Ok(Value::String(rendered))
    }

    /// Evaluate a step's gating condition. Missing paths never error: they
    /// make `Equals`/`Exists`/`Truthy` false and `NotEquals` true.
    pub fn evaluate(&self, condition: &StepCondition) -> bool {
        match condition {
            StepCondition::Equals { path, value } => self.lookup(path) == Some(value),
            StepCondition::NotEquals { path, value } => self.lookup(path) != Some(value),
            StepCondition::Exists { path } => self.lookup(path).is_some(),
            StepCondition::Truthy { path } => self.lookup(path).is_some_and(is_truthy),
        }
    }

    /// Walk a dot-separated path from its root key. `None` when any hop
    /// fails: unknown root, missing field, bad index.
    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;
        let (root_name, root_index) = split_index(root)?;
        let mut current = self.roots.get(root_name)?;
        if let Some(i) = root_index {
            current = current.get(i)?;
        }

        for segment in segments {
            let (name, index) = split_index(segment)?;
            if !name.is_empty() {
                current = current.get(name)?;
            }
            if let Some(i) = index {
                current = current.get(i)?;
            }
        }
        Some(current)
    }
}

/// One `{{...}}` occurrence in a string.
struct Placeholder {
    /// Full text including braces.
    raw: String,
    /// Trimmed inner path.
    path: String,
}

fn find_placeholders(s: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open..].find("}}") else {
            break;
        };
        let end = open + close + 2;
        let path = rest[open + 2..open + close].trim();
        if !path.is_empty() {
            found.push(Placeholder {
                raw: rest[open..end].to_string(),
                path: path.to_string(),
            });
        }
        rest = &rest[end..];
    }
    found
}

/// Split `"items[2]"` into `("items", Some(2))`; plain names get `None`.
/// A malformed index like `items[x]` fails the whole lookup.
fn split_index(segment: &str) -> Option<(&str, Option<usize>)> {
    match segment.find('[') {
        Some(open) => {
            let close = segment.find(']')?;
            let index = segment[open + 1..close].parse::<usize>().ok()?;
            Some((&segment[..open], Some(index)))
        }
        None => Some((segment, None)),
    }
}

/// How a value renders inside a mixed string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

/// Truthiness for `Truthy` conditions: `true`, non-zero numbers, and
/// non-empty strings/arrays/objects.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
