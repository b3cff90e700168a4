//! Payload and result documents for sandboxed execution.
//!
//! Every sandboxed invocation follows the same contract: the manager writes
//! exactly one `payload.json` into the private workspace before launch; the
//! isolated process reads it, does its work, and writes exactly one
//! `result.json` before exiting. Exit code 0 means the executed logic
//! completed without raising. A missing or malformed result document is an
//! error regardless of exit code — it is surfaced with a reason, never
//! silently dropped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed payload location inside the sandbox workspace.
pub const PAYLOAD_FILE: &str = "payload.json";

/// Fixed result location inside the sandbox workspace.
pub const RESULT_FILE: &str = "result.json";

/// Configuration document read by the isolated process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPayload {
    /// Capability name to execute.
    pub action: String,

    /// Input data for the capability.
    pub input: Value,

    /// Network allow-list the payload must honor (empty = no egress).
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Deadline the payload should stay within.
    pub timeout_secs: u64,

    /// Environment variables for the execution.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional mock configuration for dry runs and tests.
    #[serde(default)]
    pub mock: Option<Value>,
}

/// Structured result document written by the isolated process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDocument {
    /// "ok" or "error".
    pub status: String,

    /// Structured output data on success.
    #[serde(default)]
    pub output: Option<Value>,

    /// Error message when status is "error".
    #[serde(default)]
    pub error: Option<String>,
}

impl ResultDocument {
    /// Returns true if the payload reported success.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn ok(output: Value) -> Self {
        Self {
            status: "ok".into(),
            output: Some(output),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            output: None,
            error: Some(message.into()),
        }
    }
}

/// CPU/memory utilization sampled during a sandboxed execution.
///
/// Telemetry is best-effort: a field is `None` when the host could not
/// provide it, which is never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time consumed, in milliseconds.
    pub cpu_millis: Option<u64>,

    /// Peak resident set size, in megabytes.
    pub max_rss_mb: Option<u64>,
}

impl ResourceUsage {
    /// True when no telemetry was collected.
    pub fn is_empty(&self) -> bool {
        self.cpu_millis.is_none() && self.max_rss_mb.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_roundtrip() {
        let payload = SandboxPayload {
            action: "get".into(),
            input: json!({"url": "https://api.example.com"}),
            allowed_domains: vec!["api.example.com".into()],
            timeout_secs: 30,
            env: HashMap::from([("MODE".to_string(), "live".to_string())]),
            mock: None,
        };
        let serialized = serde_json::to_string(&payload).unwrap();
        let back: SandboxPayload = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.action, "get");
        assert_eq!(back.input["url"], "https://api.example.com");
        assert_eq!(back.allowed_domains, vec!["api.example.com"]);
        assert_eq!(back.env["MODE"], "live");
    }

    #[test]
    fn test_payload_minimal_fields() {
        let back: SandboxPayload = serde_json::from_value(json!({
            "action": "noop",
            "input": {},
            "timeout_secs": 10
        }))
        .unwrap();
        assert!(back.allowed_domains.is_empty());
        assert!(back.env.is_empty());
        assert!(back.mock.is_none());
    }

    #[test]
    fn test_result_document_ok() {
        let doc = ResultDocument::ok(json!({"rows": 3}));
        assert!(doc.is_ok());
        assert_eq!(doc.output.unwrap()["rows"], 3);
        assert!(doc.error.is_none());
    }

    #[test]
    fn test_result_document_err() {
        let doc = ResultDocument::err("connection refused");
        assert!(!doc.is_ok());
        assert_eq!(doc.error.unwrap(), "connection refused");
    }

    #[test]
    fn test_result_document_parse_minimal() {
        let doc: ResultDocument = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert!(doc.is_ok());
        assert!(doc.output.is_none());
    }

    #[test]
    fn test_resource_usage_empty() {
        let usage = ResourceUsage::default();
        assert!(usage.is_empty());

        let usage = ResourceUsage {
            cpu_millis: Some(12),
            max_rss_mb: None,
        };
        assert!(!usage.is_empty());
    }
}
