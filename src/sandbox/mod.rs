//! Sandboxed execution of generated code
//!
//! Every execution gets its own container: no published ports, every
//! capability dropped, `no-new-privileges`, memory/CPU/pids ceilings, and
//! the program copied in as a tar archive rather than mounted.
//!
//! ```text
//! SandboxExecutor ──► ContainerRuntime (DockerRuntime over /var/run/docker.sock)
//!        │
//!        └─► LiveEnvironment guard: removal exactly once, whatever happens
//! ```

pub mod api;
pub mod docker;
pub mod executor;
pub mod handle;
pub mod limits;
pub mod runtime;

pub use docker::{demux_logs, DockerRuntime};
pub use executor::{
    build_archive, classify_output, compose_program, CodeExecutor, ExecutionReport, FailureKind,
    SandboxConfig, SandboxExecutor, EXECUTION_ERROR_PREFIX, PREAMBLE, SYSTEM_ERROR_PREFIX,
};
pub use handle::LiveEnvironment;
pub use limits::ResourceLimits;
pub use runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
