//! Container runtime seam
//!
//! The executor only talks to [`ContainerRuntime`]; [`DockerRuntime`] is the
//! production implementation, tests substitute in-memory fakes.
//!
//! [`DockerRuntime`]: super::DockerRuntime

use async_trait::async_trait;

use super::limits::ResourceLimits;

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    /// Internal network to attach to; `None` means no network at all
    pub network: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Transport(String),

    #[error("{method} {endpoint} returned {status}: {message}")]
    Api {
        method: String,
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("unexpected runtime response: {0}")]
    Decode(String),

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("network {0} is not internal; sandboxes may only join internal networks")]
    NetworkNotInternal(String),

    #[error("failed to build program archive: {0}")]
    Archive(#[from] std::io::Error),
}

/// Minimal container lifecycle used by the sandbox
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Make sure `name` exists as an internal network, creating it if needed
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create (not start) a container; returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Extract a tar archive into `dir` inside the container
    async fn upload(&self, id: &str, dir: &str, archive: Vec<u8>) -> Result<(), RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits; returns the exit status
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Combined stdout/stderr collected so far
    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Force-remove; removing an already-gone container is not an error
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
