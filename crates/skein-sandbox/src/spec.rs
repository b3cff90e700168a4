//! Sandbox resource and manager configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Resource quota and isolation settings for a single sandbox.
///
/// # Isolation Model
///
/// - **Filesystem**: each sandbox gets a private temporary workspace; nothing
///   outside it is writable.
/// - **Network**: no route out by default. A non-empty `allowed_domains`
///   list grants egress to those domains only, via proxy environment the
///   executed payload honors.
/// - **Memory/CPU**: hard quotas applied to the isolated process.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Memory quota in megabytes.
    pub memory_mb: u64,

    /// CPU quota in cores (fractional allowed).
    pub cpu_cores: f64,

    /// Allowed network domains (empty = fully isolated).
    pub allowed_domains: Vec<String>,

    /// Hard deadline for the sandboxed execution.
    pub timeout: Duration,

    /// Environment variables passed to the isolated process.
    pub env: Vec<(String, String)>,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_cores: 1.0,
            allowed_domains: Vec::new(),
            timeout: Duration::from_secs(30),
            env: Vec::new(),
        }
    }
}

impl SandboxSpec {
    /// Create a spec with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory quota in megabytes.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Set the CPU quota in cores.
    pub fn with_cpu_cores(mut self, cores: f64) -> Self {
        self.cpu_cores = cores;
        self
    }

    /// Set allowed network domains.
    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    /// Add a single allowed network domain.
    pub fn add_allowed_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains.push(domain.into());
        self
    }

    /// Set the execution deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable.
    pub fn add_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Configuration for the sandbox manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum concurrently active sandboxes across all runs.
    pub max_active: usize,

    /// Root directory for sandbox workspaces (system temp dir if `None`).
    pub root_dir: Option<PathBuf>,

    /// Age ceiling past which the reaper force-cleans a sandbox.
    pub reap_after: Duration,

    /// How often the reaper scans the active registry.
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_active: 16,
            root_dir: None,
            reap_after: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec = SandboxSpec::default();
        assert_eq!(spec.memory_mb, 256);
        assert_eq!(spec.cpu_cores, 1.0);
        assert!(spec.allowed_domains.is_empty());
        assert_eq!(spec.timeout, Duration::from_secs(30));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_spec_builder() {
        let spec = SandboxSpec::new()
            .with_memory_mb(512)
            .with_cpu_cores(0.5)
            .add_allowed_domain("api.example.com")
            .with_timeout(Duration::from_secs(5))
            .add_env("MODE", "test");

        assert_eq!(spec.memory_mb, 512);
        assert_eq!(spec.cpu_cores, 0.5);
        assert_eq!(spec.allowed_domains, vec!["api.example.com"]);
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert_eq!(spec.env, vec![("MODE".to_string(), "test".to_string())]);
    }

    #[test]
    fn test_manager_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_active, 16);
        assert!(config.root_dir.is_none());
        assert_eq!(config.reap_after, Duration::from_secs(3600));
    }
}
