//! Civic Audit - natural-language questions over public financial data
//!
//! Language-model roles plan, write SQL and Python, review it, and the code
//! runs in a throwaway Docker container that can only reach the data through
//! a line-delimited JSON bridge.
//!
//! # Modules
//!
//! - `agent` - orchestration state machine, request state, sessions
//! - `roles` - generation roles (input gate, planner, SQL, code, critic, output gate)
//! - `ollama` - Ollama `/api/chat` client backing the roles
//! - `sandbox` - Docker-backed executor with guaranteed teardown
//! - `bridge` - JSON-lines RPC server and client in front of the tools
//! - `tools` - read-only Tool Service (SQLite)
//! - `config` - YAML configuration with environment overrides
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use civic_audit::{AppConfig, Orchestrator, Roles, SandboxExecutor, DockerRuntime};
//!
//! let config = AppConfig::load(None)?;
//! let runtime = Arc::new(DockerRuntime::new(&config.sandbox.docker_socket));
//! let executor = Arc::new(SandboxExecutor::new(runtime, config.sandbox.clone()));
//! let orchestrator = Orchestrator::new(Roles::ollama(&config.ollama)?, executor, config.agent);
//!
//! let result = orchestrator.run("How much was paid in expenses in 202401?", None).await?;
//! println!("{}", result.answer);
//! ```

pub mod agent;
pub mod bridge;
pub mod config;
pub mod metrics;
pub mod ollama;
pub mod roles;
pub mod sandbox;
pub mod tools;
pub mod tracing;

pub use agent::{AuditConfig, AuditError, AuditResult, AuditStatus, Orchestrator};
pub use bridge::{BridgeClient, BridgeServer};
pub use config::AppConfig;
pub use roles::{GenerationRole, RoleError, RoleId, Roles};
pub use sandbox::{CodeExecutor, DockerRuntime, SandboxExecutor};
pub use tools::{SqliteToolService, ToolService};
