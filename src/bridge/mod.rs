//! RPC bridge between sandboxed code and the host tool service
//!
//! Sandboxed code never touches the database or the host filesystem. Its only
//! reachable peer is this bridge, which speaks newline-delimited JSON over TCP
//! and forwards a fixed set of read-only methods to a [`ToolService`].
//!
//! ```text
//! ┌──────────── container ────────────┐        ┌────────── host ──────────┐
//! │  generated code                   │        │                          │
//! │    └─► preamble: query_sql(...)   │  TCP   │  BridgeServer            │
//! │          └─► {"id",..}\n ─────────┼───────►│    └─► ToolService       │
//! │          ◄── {"id","result"}\n ◄──┼────────│          (read-only DB)  │
//! └───────────────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! [`ToolService`]: crate::tools::ToolService

pub mod client;
pub mod protocol;
pub mod rate_limit;
pub mod server;

use std::time::Duration;

use serde::Deserialize;

pub use client::BridgeClient;
pub use protocol::{codes, Incoming, Method, RpcError, RpcRequest, RpcResponse};
pub use rate_limit::RateLimiter;
pub use server::{BridgeHandler, BridgeServer};

/// Server-side bridge settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the server binds, e.g. `0.0.0.0:8000`
    pub listen_addr: String,
    /// Burst size of the shared token bucket
    pub rate_limit_capacity: u32,
    /// Sustained requests per second
    pub rate_limit_per_sec: f64,
    /// Connections silent for this long are closed
    pub idle_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            rate_limit_capacity: 50,
            rate_limit_per_sec: 10.0,
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid response line: {0}")]
    Decode(String),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("response id {got} does not match request id {expected}")]
    IdMismatch {
        expected: serde_json::Value,
        got: serde_json::Value,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}
