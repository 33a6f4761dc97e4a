//! Host-side bridge client
//!
//! Default mode mirrors the sandbox preamble: connect, write one line, read
//! one line, close. [`BridgeClient::persistent`] keeps a single connection
//! open and serialises calls over it; the request/response contract is the
//! same in both modes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{encode_line, Method, RpcRequest, RpcResponse};
use super::BridgeError;
use crate::tools::{Definition, Row, ToolError, ToolService};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn round_trip(&mut self, line: &str) -> Result<RpcResponse, BridgeError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err(BridgeError::Closed);
        }

        serde_json::from_str(reply.trim_end()).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

pub struct BridgeClient {
    addr: String,
    timeout: Duration,
    next_id: AtomicU64,
    /// `Some` in persistent mode; the inner slot is empty until first use
    /// and after any failed exchange
    shared: Option<Mutex<Option<Connection>>>,
}

impl BridgeClient {
    /// Per-call client for `host:port`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            next_id: AtomicU64::new(1),
            shared: None,
        }
    }

    /// Reuse one connection for every call
    pub fn persistent(mut self) -> Self {
        self.shared = Some(Mutex::new(None));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its response
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let line = encode_line(&request).map_err(BridgeError::Encode)?;

        let response = self.exchange(&line).await?;
        if response.id != request.id {
            return Err(BridgeError::IdMismatch {
                expected: request.id,
                got: response.id,
            });
        }

        debug!(method, id, "Bridge call completed");
        Ok(response.into_result()?)
    }

    async fn exchange(&self, line: &str) -> Result<RpcResponse, BridgeError> {
        let Some(shared) = &self.shared else {
            let attempt = async {
                let mut conn = Connection::open(&self.addr).await?;
                conn.round_trip(line).await
            };
            return tokio::time::timeout(self.timeout, attempt)
                .await
                .map_err(|_| BridgeError::Timeout(self.timeout))?;
        };

        let mut slot = shared.lock().await;
        // Reconnecting counts against the same call timeout
        let attempt = async {
            if slot.is_none() {
                *slot = Some(Connection::open(&self.addr).await?);
            }
            let conn = slot.as_mut().ok_or(BridgeError::Closed)?;
            conn.round_trip(line).await
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.timeout)),
        };

        // A half-finished exchange leaves the stream out of step
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn call_method(&self, method: Method) -> Result<Value, BridgeError> {
        self.call(method.name(), method.params()).await
    }
}

fn tool_error(e: BridgeError) -> ToolError {
    match e {
        BridgeError::Rpc(rpc) => ToolError::Remote {
            code: rpc.code,
            message: rpc.message,
        },
        other => ToolError::Unavailable(other.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value)
        .map_err(|e| ToolError::Unavailable(format!("unexpected result shape: {}", e)))
}

#[async_trait]
impl ToolService for BridgeClient {
    async fn list_datasets(&self) -> Result<Vec<String>, ToolError> {
        decode(self.call_method(Method::ListDatasets).await.map_err(tool_error)?)
    }

    async fn describe(&self, name: &str) -> Result<String, ToolError> {
        let method = Method::DescribeDataset { name: name.to_string() };
        decode(self.call_method(method).await.map_err(tool_error)?)
    }

    async fn search(&self, keyword: &str) -> Result<Vec<Definition>, ToolError> {
        let method = Method::SearchDefinitions { keyword: keyword.to_string() };
        decode(self.call_method(method).await.map_err(tool_error)?)
    }

    async fn run_query(&self, query: &str) -> Result<Vec<Row>, ToolError> {
        let method = Method::RunQuery { query: query.to_string() };
        decode(self.call_method(method).await.map_err(tool_error)?)
    }
}
