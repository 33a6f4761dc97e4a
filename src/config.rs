//! Application configuration
//!
//! Loaded from an optional YAML file (every field has a default), then
//! patched from environment variables, then validated.
//!
//! ```yaml
//! ollama:
//!   base_url: http://localhost:11434
//!   models:
//!     critic: llama3.2
//! agent:
//!   max_retries: 3
//! sandbox:
//!   image: python:3.11-slim
//!   network: civic-audit-internal
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent::{AuditConfig, SessionConfig};
use crate::bridge::BridgeConfig;
use crate::roles::OllamaConfig;
use crate::sandbox::SandboxConfig;
use crate::tools::DatabaseConfig;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Logging and trace export settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable ones
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: Option<String>,
    /// OTLP collector endpoint; export is disabled when unset
    pub otlp_endpoint: Option<String>,
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ollama: OllamaConfig,
    pub agent: AuditConfig,
    pub sandbox: SandboxConfig,
    pub bridge: BridgeConfig,
    pub database: DatabaseConfig,
    pub sessions: SessionConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Without one, `config.yaml` in the
    /// working directory is used if present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse YAML text; an empty document yields the defaults
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_URL") {
            self.ollama.base_url = url;
        }
        if let Some(host) = lookup("BRIDGE_HOST") {
            self.sandbox.bridge_host = host;
        }
        if let Some(port) = lookup("BRIDGE_PORT").and_then(|p| p.parse().ok()) {
            self.sandbox.bridge_port = port;
        }
        if let Some(listen) = lookup("BRIDGE_LISTEN") {
            self.bridge.listen_addr = listen;
        }
        if let Some(network) = lookup("DOCKER_NETWORK_NAME") {
            self.sandbox.network = Some(network);
        }
        if let Some(image) = lookup("SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(db) = lookup("CIVIC_DB_PATH") {
            self.database.path = PathBuf::from(db);
        }
        if let Some(endpoint) = lookup("CIVIC_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_retries == 0 {
            return Err(ConfigError::Invalid("agent.max_retries must be at least 1".into()));
        }
        if self.agent.step_budget < self.agent.min_step_budget() {
            return Err(ConfigError::Invalid(format!(
                "agent.step_budget must be at least {} for {} retries",
                self.agent.min_step_budget(),
                self.agent.max_retries
            )));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_secs must be at least 1".into()));
        }
        if self.agent.execution_deadline_secs <= self.sandbox.timeout_secs {
            return Err(ConfigError::Invalid(
                "agent.execution_deadline_secs must exceed sandbox.timeout_secs".into(),
            ));
        }
        if self.sandbox.limits.memory_bytes == 0 {
            return Err(ConfigError::Invalid("sandbox.limits.memory_bytes must be positive".into()));
        }
        if self.bridge.rate_limit_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bridge.rate_limit_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
