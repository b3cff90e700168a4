//! Execution backends for sandboxed payloads.
//!
//! The manager decides *when* a sandbox runs; a backend decides *how*. Two
//! implementations ship with the crate:
//!
//! - [`ProcessBackend`] — OS-level isolation (bubblewrap on Linux,
//!   sandbox-exec on macOS) around a runner command that honors the payload
//!   contract.
//! - [`MockBackend`] — an in-process deterministic fake for tests and dry
//!   runs, programmable per action.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::payload::{PAYLOAD_FILE, RESULT_FILE, ResourceUsage, ResultDocument, SandboxPayload};
use crate::platform::{Platform, SandboxSupport};
use crate::spec::SandboxSpec;

/// Raw outcome of a backend execution, before artifact extraction.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    /// Process exit code; `None` when the process was killed.
    pub exit_code: Option<i32>,
    /// Captured standard output (partial on timeout).
    pub stdout: String,
    /// Captured standard error (partial on timeout).
    pub stderr: String,
    /// The deadline elapsed and the process was force-killed.
    pub timed_out: bool,
    /// The caller cancelled and the process was force-killed.
    pub cancelled: bool,
    /// Best-effort resource telemetry.
    pub usage: ResourceUsage,
}

/// Pluggable isolated execution backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run the payload materialized in `workspace` under the spec's quota
    /// and deadline. Must return promptly when `cancel` fires, and must not
    /// leave the process running after returning.
    async fn execute(
        &self,
        workspace: &Path,
        spec: &SandboxSpec,
        cancel: &CancellationToken,
    ) -> SandboxResult<BackendOutput>;
}

// ---------------------------------------------------------------------------
// ProcessBackend — OS-level isolation
// ---------------------------------------------------------------------------

/// Executes the runner command in an OS-level sandbox.
///
/// The runner is any program honoring the payload contract: read
/// `payload.json` from its working directory, write `result.json`, exit 0
/// on success. The backend binds the workspace read-write, mounts the rest
/// of the filesystem read-only, detaches the network namespace unless the
/// spec allows domains, and applies memory/CPU rlimits.
#[derive(Debug)]
pub struct ProcessBackend {
    runner: Vec<String>,
    platform: Platform,
    egress_proxy: Option<String>,
}

impl ProcessBackend {
    /// Create a process backend wrapping the given runner command.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Unavailable`] when the host cannot isolate
    /// processes (missing bubblewrap, unsupported OS).
    pub fn new(runner: Vec<String>) -> SandboxResult<Self> {
        if runner.is_empty() {
            return Err(SandboxError::SpawnFailed(
                "runner command cannot be empty".into(),
            ));
        }

        match SandboxSupport::detect() {
            SandboxSupport::Available { platform } => Ok(Self {
                runner,
                platform,
                egress_proxy: None,
            }),
            SandboxSupport::MissingDependency {
                missing,
                install_hint,
                ..
            } => Err(SandboxError::Unavailable {
                message: format!("Missing dependencies: {}", missing.join(", ")),
                install_hint,
            }),
            SandboxSupport::Unsupported { platform_name } => Err(SandboxError::Unavailable {
                message: format!("Platform not supported: {platform_name}"),
                install_hint: "Sandboxing is only available on macOS and Linux.".to_string(),
            }),
        }
    }

    /// Route allow-listed egress through a filtering proxy at `addr`
    /// (e.g. `http://127.0.0.1:3128`). Without a proxy, specs naming
    /// `allowed_domains` are rejected rather than given open network
    /// access.
    pub fn with_egress_proxy(mut self, addr: impl Into<String>) -> Self {
        self.egress_proxy = Some(addr.into());
        self
    }

    /// A non-empty allow-list is only honorable through the proxy; with no
    /// proxy configured the alternative would be unrestricted egress.
    fn egress_guard(&self, spec: &SandboxSpec) -> SandboxResult<()> {
        if !spec.allowed_domains.is_empty() && self.egress_proxy.is_none() {
            return Err(SandboxError::Unavailable {
                message: "network allow-list requires an egress proxy".to_string(),
                install_hint: "Configure ProcessBackend::with_egress_proxy with a \
                               domain-filtering proxy address."
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Shell fragment applying rlimits then exec'ing the runner.
    fn limited_invocation(&self, spec: &SandboxSpec) -> String {
        let mem_kb = spec.memory_mb * 1024;
        // CPU-seconds budget scaled by the core quota, minimum one second.
        let cpu_secs = ((spec.timeout.as_secs_f64() * spec.cpu_cores).ceil() as u64).max(1);
        let runner = self
            .runner
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        format!("ulimit -v {mem_kb}; ulimit -t {cpu_secs}; exec {runner}")
    }

    /// Build the full sandboxed command line for this platform.
    fn build_command(&self, workspace: &Path, spec: &SandboxSpec) -> tokio::process::Command {
        let invocation = self.limited_invocation(spec);

        let mut cmd = match self.platform {
            Platform::Linux => {
                let mut cmd = tokio::process::Command::new("bwrap");
                cmd.arg("--die-with-parent")
                    .arg("--ro-bind")
                    .arg("/")
                    .arg("/")
                    .arg("--dev")
                    .arg("/dev")
                    .arg("--proc")
                    .arg("/proc")
                    .arg("--tmpfs")
                    .arg("/tmp")
                    .arg("--bind")
                    .arg(workspace)
                    .arg(workspace)
                    .arg("--chdir")
                    .arg(workspace)
                    .arg("--unshare-all");
                if !spec.allowed_domains.is_empty() {
                    // egress_guard rejects allow-lists without a proxy, so
                    // sharing the namespace here always pairs with the
                    // filtering-proxy env below.
                    cmd.arg("--share-net");
                }
                cmd.arg("/bin/sh").arg("-c").arg(&invocation);
                cmd
            }
            Platform::MacOS => {
                let profile = seatbelt_profile(workspace, !spec.allowed_domains.is_empty());
                let mut cmd = tokio::process::Command::new("sandbox-exec");
                cmd.arg("-p")
                    .arg(profile)
                    .arg("/bin/sh")
                    .arg("-c")
                    .arg(&invocation);
                cmd.current_dir(workspace);
                cmd
            }
            // new() rejects Unsupported; unreachable in practice
            Platform::Unsupported => {
                let mut cmd = tokio::process::Command::new("/bin/sh");
                cmd.arg("-c").arg(&invocation).current_dir(workspace);
                cmd
            }
        };

        cmd.env_clear();
        cmd.env("PATH", "/usr/bin:/bin");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if !spec.allowed_domains.is_empty()
            && let Some(proxy) = &self.egress_proxy
        {
            cmd.env("HTTP_PROXY", proxy);
            cmd.env("HTTPS_PROXY", proxy);
            cmd.env("SKEIN_ALLOWED_DOMAINS", spec.allowed_domains.join(","));
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn execute(
        &self,
        workspace: &Path,
        spec: &SandboxSpec,
        cancel: &CancellationToken,
    ) -> SandboxResult<BackendOutput> {
        self.egress_guard(spec)?;
        let mut cmd = self.build_command(workspace, spec);
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        debug!(pid = ?pid, workspace = %workspace.display(), "Spawned sandboxed process");

        // Drain pipes in the background so the child never blocks on a full
        // buffer; whatever was buffered before a kill is still collected.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout_pipe));
        let stderr_task = tokio::spawn(read_stream(stderr_pipe));

        let deadline = tokio::time::Instant::now() + spec.timeout;
        let mut sample_tick = tokio::time::interval(Duration::from_millis(250));
        sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut usage = ResourceUsage::default();

        let (exit_code, timed_out, cancelled) = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
                    break (status.code(), false, false);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(pid = ?pid, timeout = ?spec.timeout, "Sandbox deadline elapsed, killing process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break (None, true, false);
                }
                _ = cancel.cancelled() => {
                    debug!(pid = ?pid, "Sandbox cancelled, killing process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break (None, false, true);
                }
                _ = sample_tick.tick() => {
                    if let Some(pid) = pid
                        && let Some(sampled) = sample_usage(pid)
                    {
                        usage = sampled;
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(BackendOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
            usage,
        })
    }
}

/// Read an async pipe to the end, lossily converting to UTF-8.
async fn read_stream<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}

/// Sample CPU time and peak RSS for a live process.
///
/// Linux-only; other platforms report no telemetry.
#[cfg(target_os = "linux")]
fn sample_usage(pid: u32) -> Option<ResourceUsage> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let max_rss_mb = status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmHWM:")?;
        let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kb / 1024)
    });

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields 14/15 (utime/stime) follow the parenthesized comm field.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let cpu_millis = match (fields.get(11), fields.get(12)) {
        (Some(utime), Some(stime)) => {
            let ticks: u64 =
                utime.parse::<u64>().ok()? + stime.parse::<u64>().ok()?;
            // USER_HZ is 100 on every mainstream kernel config.
            Some(ticks * 10)
        }
        _ => None,
    };

    Some(ResourceUsage {
        cpu_millis,
        max_rss_mb,
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_usage(_pid: u32) -> Option<ResourceUsage> {
    None
}

/// Minimal POSIX shell quoting.
fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Seatbelt profile confining writes to the workspace, optionally with network.
fn seatbelt_profile(workspace: &Path, allow_network: bool) -> String {
    let ws = workspace.display();
    let network = if allow_network {
        "(allow network*)"
    } else {
        "(deny network*)"
    };
    format!(
        "(version 1)\n\
         (allow default)\n\
         {network}\n\
         (deny file-write*)\n\
         (allow file-write* (subpath \"{ws}\"))\n\
         (allow file-write* (subpath \"/private/tmp\"))"
    )
}

// ---------------------------------------------------------------------------
// MockBackend — deterministic in-process fake
// ---------------------------------------------------------------------------

/// Scripted behavior for one action in the mock backend.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Write an ok result document with this output and exit 0.
    Succeed(serde_json::Value),
    /// Write an ok result document echoing the payload input and exit 0.
    EchoInput,
    /// Write an error result document and exit 1.
    Fail(String),
    /// Exit with this code without writing any result document.
    ExitWithout(i32),
    /// Sleep before succeeding; exceeds the spec timeout to simulate a hang.
    Sleep(Duration),
}

/// In-process stand-in for third-party execution, used by tests and dry runs.
///
/// Behaviors are keyed by the payload's action name; unscripted actions fall
/// back to [`MockBehavior::EchoInput`]. The mock honors the same payload
/// contract and deadline semantics as the real backend, without spawning
/// anything.
pub struct MockBackend {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    fallback: MockBehavior,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            fallback: MockBehavior::EchoInput,
        }
    }

    /// Script a behavior for an action name.
    pub fn with_behavior(self, action: impl Into<String>, behavior: MockBehavior) -> Self {
        self.behaviors.lock().insert(action.into(), behavior);
        self
    }

    /// Replace the fallback behavior for unscripted actions.
    pub fn with_fallback(mut self, behavior: MockBehavior) -> Self {
        self.fallback = behavior;
        self
    }

    fn behavior_for(&self, action: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .get(action)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn execute(
        &self,
        workspace: &Path,
        spec: &SandboxSpec,
        cancel: &CancellationToken,
    ) -> SandboxResult<BackendOutput> {
        let payload_path: PathBuf = workspace.join(PAYLOAD_FILE);
        let raw = tokio::fs::read_to_string(&payload_path).await.map_err(|e| {
            SandboxError::Payload(format!("cannot read {}: {e}", payload_path.display()))
        })?;
        let payload: SandboxPayload = serde_json::from_str(&raw)
            .map_err(|e| SandboxError::Payload(format!("malformed payload: {e}")))?;

        let behavior = self.behavior_for(&payload.action);
        debug!(action = %payload.action, ?behavior, "Mock backend executing");

        let mut output = BackendOutput {
            exit_code: Some(0),
            stdout: format!("mock: executing action '{}'\n", payload.action),
            stderr: String::new(),
            timed_out: false,
            cancelled: false,
            usage: ResourceUsage::default(),
        };

        match behavior {
            MockBehavior::Succeed(value) => {
                write_result(workspace, &ResultDocument::ok(value)).await?;
            }
            MockBehavior::EchoInput => {
                write_result(workspace, &ResultDocument::ok(payload.input.clone())).await?;
            }
            MockBehavior::Fail(message) => {
                write_result(workspace, &ResultDocument::err(&message)).await?;
                output.stderr = format!("mock: {message}\n");
                output.exit_code = Some(1);
            }
            MockBehavior::ExitWithout(code) => {
                output.exit_code = Some(code);
            }
            MockBehavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        write_result(workspace, &ResultDocument::ok(payload.input.clone())).await?;
                    }
                    _ = tokio::time::sleep(spec.timeout) => {
                        output.exit_code = None;
                        output.timed_out = true;
                    }
                    _ = cancel.cancelled() => {
                        output.exit_code = None;
                        output.cancelled = true;
                    }
                }
            }
        }

        Ok(output)
    }
}

async fn write_result(workspace: &Path, doc: &ResultDocument) -> SandboxResult<()> {
    let serialized = serde_json::to_string_pretty(doc)
        .map_err(|e| SandboxError::Payload(format!("cannot serialize result: {e}")))?;
    tokio::fs::write(workspace.join(RESULT_FILE), serialized)
        .await
        .map_err(SandboxError::Io)
}
