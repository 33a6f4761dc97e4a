//! Generation roles
//!
//! Each role is a pure `(context) -> text` function behind
//! [`GenerationRole`]. The orchestrator owns one instance per role and only
//! ever branches on fixed marker tokens in what comes back.
//!
//! ```text
//! InputGate ─ Planner ─ SqlGenerator ─ SqlChecker ─ CodeGenerator ─ Critic ─ OutputGate
//! ```

pub mod ollama;
pub mod parsing;
pub mod prompts;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

pub use ollama::OllamaRole;
pub use parsing::{
    is_rejection, is_unsafe_input, is_unsafe_output, parse_sql_check, strip_code_fences, SqlCheck,
};

/// Which role a call is for; also the metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleId {
    InputGate,
    Planner,
    SqlGenerator,
    SqlChecker,
    CodeGenerator,
    Critic,
    OutputGate,
}

impl RoleId {
    pub const ALL: [RoleId; 7] = [
        RoleId::InputGate,
        RoleId::Planner,
        RoleId::SqlGenerator,
        RoleId::SqlChecker,
        RoleId::CodeGenerator,
        RoleId::Critic,
        RoleId::OutputGate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleId::InputGate => "input_gate",
            RoleId::Planner => "planner",
            RoleId::SqlGenerator => "sql_generator",
            RoleId::SqlChecker => "sql_checker",
            RoleId::CodeGenerator => "code_generator",
            RoleId::Critic => "critic",
            RoleId::OutputGate => "output_gate",
        }
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that end the request; a role is never retried
#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("model backend unreachable: {0}")]
    Transport(String),

    #[error("model call timed out")]
    Timeout,

    #[error("model returned an empty reply")]
    Empty,
}

#[async_trait]
pub trait GenerationRole: Send + Sync {
    async fn invoke(&self, context: &str) -> Result<String, RoleError>;
}

/// One implementation per role, injected into the orchestrator
#[derive(Clone)]
pub struct Roles {
    pub input_gate: Arc<dyn GenerationRole>,
    pub planner: Arc<dyn GenerationRole>,
    pub sql_generator: Arc<dyn GenerationRole>,
    pub sql_checker: Arc<dyn GenerationRole>,
    pub code_generator: Arc<dyn GenerationRole>,
    pub critic: Arc<dyn GenerationRole>,
    pub output_gate: Arc<dyn GenerationRole>,
}

impl Roles {
    pub fn get(&self, role: RoleId) -> &Arc<dyn GenerationRole> {
        match role {
            RoleId::InputGate => &self.input_gate,
            RoleId::Planner => &self.planner,
            RoleId::SqlGenerator => &self.sql_generator,
            RoleId::SqlChecker => &self.sql_checker,
            RoleId::CodeGenerator => &self.code_generator,
            RoleId::Critic => &self.critic,
            RoleId::OutputGate => &self.output_gate,
        }
    }

    /// Every role backed by Ollama, sharing one HTTP client
    pub fn ollama(config: &OllamaConfig) -> Result<Self, RoleError> {
        let client = crate::ollama::ChatClient::new(&config.base_url, config.request_timeout())
            .map_err(|e| RoleError::Transport(e.to_string()))?;

        let build = |role: RoleId| -> Arc<dyn GenerationRole> {
            Arc::new(OllamaRole::new(
                client.clone(),
                role,
                config.model_for(role),
                prompts::system_prompt(role),
            ))
        };

        Ok(Self {
            input_gate: build(RoleId::InputGate),
            planner: build(RoleId::Planner),
            sql_generator: build(RoleId::SqlGenerator),
            sql_checker: build(RoleId::SqlChecker),
            code_generator: build(RoleId::CodeGenerator),
            critic: build(RoleId::Critic),
            output_gate: build(RoleId::OutputGate),
        })
    }
}

/// Model backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    /// Model used by roles without an entry in `models`
    pub default_model: String,
    /// Per-role model overrides, e.g. `critic: qwen2.5-coder`
    pub models: HashMap<RoleId, String>,
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            default_model: "llama3.2".to_string(),
            models: HashMap::new(),
            request_timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    pub fn model_for(&self, role: RoleId) -> &str {
        self.models
            .get(&role)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
