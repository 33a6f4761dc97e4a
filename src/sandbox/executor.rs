//! Sandbox executor
//!
//! One call = one fresh container:
//!
//! ```text
//! ensure image (once) → create → upload preamble+code → start
//!        → wait (≤ timeout) → collect logs → remove (always, exactly once)
//! ```
//!
//! The result is a single text blob. Callers learn about failure only by
//! looking at it, see [`classify_output`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::docker::DEFAULT_DOCKER_SOCKET;
use super::handle::LiveEnvironment;
use super::limits::ResourceLimits;
use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::metrics::{SANDBOX_EXECUTIONS, SANDBOX_EXECUTION_DURATION};

/// Prepended to every program; gives generated code its data functions
pub const PREAMBLE: &str = include_str!("preamble.py");

/// Prefix of failures caused by the environment rather than the code
pub const SYSTEM_ERROR_PREFIX: &str = "System Error";
/// Prefix of failures the code caused (timeout, abnormal exit)
pub const EXECUTION_ERROR_PREFIX: &str = "Execution Error";
/// Marker of an uncaught in-process exception
pub const TRACEBACK_MARKER: &str = "Traceback";

const SCRIPT_DIR: &str = "/tmp";
const SCRIPT_NAME: &str = "script.py";

/// Sandbox launch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base image with a Python interpreter
    pub image: String,
    /// Wall-clock limit for one run
    pub timeout_secs: u64,
    pub limits: ResourceLimits,
    /// Internal network the container joins, with the bridge as its only
    /// peer. Created on first use; a non-internal network is refused. `None`
    /// runs without any network, so bridge calls fail.
    pub network: Option<String>,
    /// Bridge address as seen from inside the container
    pub bridge_host: String,
    pub bridge_port: u16,
    pub docker_socket: String,
    /// Pull the image on first use when it is missing
    pub pull_missing: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            timeout_secs: 30,
            limits: ResourceLimits::default(),
            network: None,
            bridge_host: "civic-audit-bridge".to_string(),
            bridge_port: 8000,
            docker_socket: DEFAULT_DOCKER_SOCKET.to_string(),
            pull_missing: true,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════════════════════

/// Why an execution counts as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The environment could not launch, run or report the program
    Infrastructure,
    /// The program raised, crashed or ran out of time
    Runtime,
}

/// Classify execution output
///
/// `None` means success. Textual markers are the whole contract:
/// a leading `System Error`, a leading `Execution Error`, or a `Traceback`
/// anywhere.
pub fn classify_output(output: &str) -> Option<FailureKind> {
    let head = output.trim_start();
    if head.starts_with(SYSTEM_ERROR_PREFIX) {
        Some(FailureKind::Infrastructure)
    } else if head.starts_with(EXECUTION_ERROR_PREFIX) || output.contains(TRACEBACK_MARKER) {
        Some(FailureKind::Runtime)
    } else {
        None
    }
}

/// Outcome of one sandbox run
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Combined output, or a prefixed failure description
    pub output: String,
    /// Exit status when the container exited on its own
    pub exit_code: Option<i64>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionReport {
    pub fn failure(&self) -> Option<FailureKind> {
        classify_output(&self.output)
    }

    pub fn succeeded(&self) -> bool {
        self.failure().is_none()
    }
}

/// Runs candidate code and returns its output text
///
/// The orchestrator only depends on this trait.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: &str, trace_id: &str) -> String;
}

/// Preamble followed by the candidate code
pub fn compose_program(code: &str) -> String {
    format!("{}\n\n{}\n", PREAMBLE, code)
}

/// Single-file tar archive for the runtime's archive upload
pub fn build_archive(name: &str, contents: &str) -> std::io::Result<Vec<u8>> {
    let bytes = contents.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, bytes)?;
    builder.into_inner()
}

// ═══════════════════════════════════════════════════════════════════════════
// SandboxExecutor
// ═══════════════════════════════════════════════════════════════════════════

struct RunOutcome {
    exit_code: Option<i64>,
    logs: String,
    timed_out: bool,
}

pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    ready: OnceCell<()>,
    live: Arc<AtomicUsize>,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            ready: OnceCell::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Containers created by this executor and not yet removed
    pub fn live_environments(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Make sure the network and base image exist before the first request
    ///
    /// Optional; `run` does the same lazily.
    pub async fn prepare(&self) -> Result<(), RuntimeError> {
        self.ready
            .get_or_try_init(|| async {
                if let Some(network) = &self.config.network {
                    self.runtime.ensure_network(network).await?;
                }
                if self.config.pull_missing {
                    self.runtime.ensure_image(&self.config.image).await?;
                }
                Ok::<(), RuntimeError>(())
            })
            .await?;
        Ok(())
    }

    fn container_spec(&self, trace_id: &str) -> ContainerSpec {
        ContainerSpec {
            name: format!("civic-sandbox-{}", Uuid::now_v7()),
            image: self.config.image.clone(),
            cmd: vec!["python".to_string(), format!("{}/{}", SCRIPT_DIR, SCRIPT_NAME)],
            env: vec![
                format!("BRIDGE_HOST={}", self.config.bridge_host),
                format!("BRIDGE_PORT={}", self.config.bridge_port),
                format!("CIVIC_TRACE_ID={}", trace_id),
            ],
            limits: self.config.limits.clone(),
            network: self.config.network.clone(),
        }
    }

    /// Run `code` in a fresh container
    pub async fn run(&self, code: &str, trace_id: &str) -> ExecutionReport {
        let span = info_span!(
            "sandbox_execution",
            trace_id = %trace_id,
            otel.name = "sandbox_execution",
            container = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let (output, exit_code, timed_out) = match self.launch(code, trace_id).await {
                Ok(outcome) => (self.render(&outcome), outcome.exit_code, outcome.timed_out),
                Err(e) => (format!("{}: {}", SYSTEM_ERROR_PREFIX, e), None, false),
            };

            let report = ExecutionReport {
                output,
                exit_code,
                duration: start.elapsed(),
                timed_out,
            };

            let status = match (report.timed_out, report.failure()) {
                (true, _) => "timeout",
                (false, None) => "success",
                (false, Some(FailureKind::Runtime)) => "runtime_error",
                (false, Some(FailureKind::Infrastructure)) => "system_error",
            };
            SANDBOX_EXECUTIONS.with_label_values(&[status]).inc();
            SANDBOX_EXECUTION_DURATION.observe(report.duration.as_secs_f64());
            info!(status, exit_code = ?report.exit_code, duration_ms = report.duration.as_millis() as u64, "Sandbox run finished");

            report
        }
        .instrument(span)
        .await
    }

    /// Create, drive and tear down one container
    async fn launch(&self, code: &str, trace_id: &str) -> Result<RunOutcome, RuntimeError> {
        self.prepare().await?;

        let archive = build_archive(SCRIPT_NAME, &compose_program(code))?;
        let spec = self.container_spec(trace_id);
        let id = self.runtime.create(&spec).await?;

        tracing::Span::current().record("container", id.as_str());
        debug!(container = %id, name = %spec.name, "Sandbox created");

        let env = LiveEnvironment::new(id, Arc::clone(&self.runtime), Arc::clone(&self.live));
        let outcome = self.drive(env.id(), archive).await;

        if let Err(e) = env.teardown().await {
            // Output is still valid; the failure is counted and logged
            warn!(error = %e, "Sandbox teardown failed");
        }

        outcome
    }

    async fn drive(&self, id: &str, archive: Vec<u8>) -> Result<RunOutcome, RuntimeError> {
        self.runtime.upload(id, SCRIPT_DIR, archive).await?;
        self.runtime.start(id).await?;

        match tokio::time::timeout(self.config.timeout(), self.runtime.wait(id)).await {
            Ok(exit) => {
                let exit_code = exit?;
                let logs = self.runtime.logs(id).await?;
                Ok(RunOutcome {
                    exit_code: Some(exit_code),
                    logs,
                    timed_out: false,
                })
            }
            Err(_) => {
                // Partial output helps the next generation attempt
                let logs = match self.runtime.logs(id).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        debug!(error = %e, "No logs from timed-out sandbox");
                        String::new()
                    }
                };
                Ok(RunOutcome {
                    exit_code: None,
                    logs,
                    timed_out: true,
                })
            }
        }
    }

    fn render(&self, outcome: &RunOutcome) -> String {
        if outcome.timed_out {
            return join_detail(
                format!(
                    "{}: timed out after {}s",
                    EXECUTION_ERROR_PREFIX, self.config.timeout_secs
                ),
                &outcome.logs,
            );
        }

        match outcome.exit_code {
            Some(0) | None => outcome.logs.clone(),
            // A traceback already marks the failure and carries the detail
            Some(_) if outcome.logs.contains(TRACEBACK_MARKER) => outcome.logs.clone(),
            Some(137) => join_detail(
                format!(
                    "{}: exit status 137 (killed, memory limit is {} bytes)",
                    EXECUTION_ERROR_PREFIX, self.config.limits.memory_bytes
                ),
                &outcome.logs,
            ),
            Some(code) => join_detail(
                format!("{}: exit status {}", EXECUTION_ERROR_PREFIX, code),
                &outcome.logs,
            ),
        }
    }
}

fn join_detail(headline: String, logs: &str) -> String {
    let logs = logs.trim_end();
    if logs.is_empty() {
        headline
    } else {
        format!("{}\n{}", headline, logs)
    }
}

#[async_trait]
impl CodeExecutor for SandboxExecutor {
    async fn execute(&self, code: &str, trace_id: &str) -> String {
        self.run(code, trace_id).await.output
    }
}
