//! Read-only data tools
//!
//! The `ToolService` trait is the only data-access surface generated code
//! ever reaches, and only through the bridge. Implementations:
//!
//! - [`SqliteToolService`]: read-only SQLite database on the host
//! - [`crate::bridge::BridgeClient`]: forwards each call over the bridge
//!
//! Read-only enforcement belongs to the implementation; callers do not
//! re-verify it.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sqlite::{DatabaseConfig, SqliteToolService};

/// One result row, column name → value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A dataset whose name or definition matched a search keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("dataset '{0}' not found")]
    NotFound(String),

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("tool service unavailable: {0}")]
    Unavailable(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}

/// Fixed set of read-only operations over the audit dataset
#[async_trait]
pub trait ToolService: Send + Sync {
    /// Names of every queryable dataset
    async fn list_datasets(&self) -> Result<Vec<String>, ToolError>;

    /// Shape (DDL) of a named dataset
    async fn describe(&self, name: &str) -> Result<String, ToolError>;

    /// Datasets whose name or definition mentions `keyword`
    async fn search(&self, keyword: &str) -> Result<Vec<Definition>, ToolError>;

    /// Run a read-only query
    async fn run_query(&self, query: &str) -> Result<Vec<Row>, ToolError>;
}
