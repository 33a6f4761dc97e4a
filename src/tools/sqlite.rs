//! SQLite-backed tool service
//!
//! The database is opened with `SQLITE_OPEN_READ_ONLY`, so writes fail at the
//! driver level. Statements are additionally checked with
//! `Statement::readonly()` to give callers a clear rejection message.
//! `ATTACH` counts as read-only to SQLite, so the attached-database limit is
//! zero: queries only ever see the audit file.
//!
//! `rusqlite::Connection` is not `Sync`; a mutex serialises access and every
//! call runs on the blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::limits::Limit;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use tracing::debug;

use super::{Definition, Row, ToolError, ToolService};

/// Location and limits of the audit database
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file produced by the ETL pipeline
    pub path: PathBuf,
    /// Rows returned per query before truncation
    pub max_rows: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/civic_audit.db"),
            max_rows: 1000,
        }
    }
}

/// Read-only tool service over a SQLite file
pub struct SqliteToolService {
    conn: Arc<Mutex<Connection>>,
    max_rows: usize,
}

impl SqliteToolService {
    /// Open the database read-only
    pub fn open(config: &DatabaseConfig) -> Result<Self, ToolError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let unavailable =
            |e: rusqlite::Error| ToolError::Unavailable(format!("{}: {}", config.path.display(), e));
        let conn = Connection::open_with_flags(&config.path, flags).map_err(unavailable)?;

        // The connection is shared by every sandbox: no other files, no
        // connection-level state changes
        conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
        conn.pragma_update(None, "query_only", true).map_err(unavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_rows: config.max_rows,
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T, ToolError>
    where
        F: FnOnce(&Connection) -> Result<T, ToolError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ToolError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| ToolError::Unavailable(e.to_string()))?
    }
}

fn query_error(e: rusqlite::Error) -> ToolError {
    ToolError::Query(e.to_string())
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[async_trait]
impl ToolService for SqliteToolService {
    async fn list_datasets(&self) -> Result<Vec<String>, ToolError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .map_err(query_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;
            Ok(names)
        })
        .await
    }

    async fn describe(&self, name: &str) -> Result<String, ToolError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(query_error)?
            .ok_or(ToolError::NotFound(name))
        })
        .await
    }

    async fn search(&self, keyword: &str) -> Result<Vec<Definition>, ToolError> {
        let pattern = format!("%{}%", keyword.trim());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, sql FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                     AND (name LIKE ?1 OR sql LIKE ?1) ORDER BY name",
                )
                .map_err(query_error)?;
            let found = stmt
                .query_map([&pattern], |row| {
                    Ok(Definition {
                        name: row.get(0)?,
                        definition: row.get(1)?,
                    })
                })
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;
            Ok(found)
        })
        .await
    }

    async fn run_query(&self, query: &str) -> Result<Vec<Row>, ToolError> {
        let query = query.to_string();
        let max_rows = self.max_rows;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&query).map_err(query_error)?;
            if !stmt.readonly() {
                return Err(ToolError::Rejected(
                    "only read-only (SELECT) statements are allowed".to_string(),
                ));
            }

            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query([]).map_err(query_error)?;
            let mut out = Vec::new();

            while let Some(row) = rows.next().map_err(query_error)? {
                if out.len() >= max_rows {
                    debug!(max_rows, "Query result truncated");
                    break;
                }
                let mut record = Row::new();
                for (i, column) in columns.iter().enumerate() {
                    let value = row.get_ref(i).map_err(query_error)?;
                    record.insert(column.clone(), to_json(value));
                }
                out.push(record);
            }

            Ok(out)
        })
        .await
    }
}
