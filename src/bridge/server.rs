//! Bridge server
//!
//! One task per connection; each task reads lines until EOF or idle timeout
//! and writes exactly one response line per request line. A line that cannot
//! be attributed to a request (not JSON, or no `id`) gets no response, and
//! the connection keeps going.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{codes, encode_line, parse_line, Incoming, Method, RpcError, RpcResponse};
use super::rate_limit::RateLimiter;
use super::{BridgeConfig, BridgeError};
use crate::metrics::{
    BRIDGE_CONNECTIONS, BRIDGE_MALFORMED_LINES, BRIDGE_RATE_LIMITED, BRIDGE_REQUESTS,
};
use crate::tools::ToolService;

/// Longest line accepted before the connection is dropped
const MAX_LINE_BYTES: usize = 1 << 20;

// ═══════════════════════════════════════════════════════════════════════════
// BridgeHandler
// ═══════════════════════════════════════════════════════════════════════════
// Turns one received line into at most one response. Transport-free, so the
// whole request path is testable without sockets.
// ═══════════════════════════════════════════════════════════════════════════

pub struct BridgeHandler {
    tools: Arc<dyn ToolService>,
    limiter: RateLimiter,
}

impl BridgeHandler {
    pub fn new(tools: Arc<dyn ToolService>, limiter: RateLimiter) -> Self {
        Self { tools, limiter }
    }

    /// Response for one line, or `None` when the line is dropped
    pub async fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let request = match parse_line(line) {
            Incoming::Request(request) => request,
            Incoming::Invalid { id, reason } => {
                BRIDGE_REQUESTS.with_label_values(&["invalid", "error"]).inc();
                debug!(%id, reason = %reason, "Invalid bridge request");
                return Some(RpcResponse::failure(
                    id,
                    RpcError::new(codes::INVALID_REQUEST, format!("invalid request: {}", reason)),
                ));
            }
            Incoming::Malformed(reason) => {
                BRIDGE_MALFORMED_LINES.inc();
                warn!(reason = %reason, bytes = line.len(), "Dropping malformed bridge line");
                return None;
            }
        };

        if !self.limiter.try_acquire() {
            BRIDGE_RATE_LIMITED.inc();
            return Some(RpcResponse::failure(
                request.id,
                RpcError::new(
                    codes::RATE_LIMITED,
                    format!("rate limited, retry after {:?}", self.limiter.retry_after()),
                ),
            ));
        }

        let method = match Method::from_request(&request) {
            Ok(method) => method,
            Err(e) => {
                BRIDGE_REQUESTS.with_label_values(&["unknown", "error"]).inc();
                debug!(method = %request.method, error = %e, "Rejected bridge request");
                return Some(RpcResponse::failure(request.id, e));
            }
        };

        let name = method.name();
        let response = match self.dispatch(method).await {
            Ok(result) => {
                BRIDGE_REQUESTS.with_label_values(&[name, "ok"]).inc();
                RpcResponse::success(request.id, result)
            }
            Err(e) => {
                BRIDGE_REQUESTS.with_label_values(&[name, "error"]).inc();
                debug!(method = name, error = %e, "Tool call failed");
                RpcResponse::failure(request.id, e)
            }
        };

        Some(response)
    }

    async fn dispatch(&self, method: Method) -> Result<Value, RpcError> {
        let value = match method {
            Method::ListDatasets => Value::from(self.tools.list_datasets().await?),
            Method::DescribeDataset { name } => Value::String(self.tools.describe(&name).await?),
            Method::RunQuery { query } => Value::Array(
                self.tools
                    .run_query(&query)
                    .await?
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            ),
            Method::SearchDefinitions { keyword } => {
                let found = self.tools.search(&keyword).await?;
                serde_json::to_value(found)
                    .map_err(|e| RpcError::new(codes::INTERNAL, e.to_string()))?
            }
        };
        Ok(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BridgeServer
// ═══════════════════════════════════════════════════════════════════════════

pub struct BridgeServer {
    listener: TcpListener,
    handler: Arc<BridgeHandler>,
    idle_timeout: Duration,
}

impl BridgeServer {
    /// Bind the listener
    ///
    /// Port `0` picks a free port; read it back with [`local_addr`].
    ///
    /// [`local_addr`]: BridgeServer::local_addr
    pub async fn bind(config: &BridgeConfig, tools: Arc<dyn ToolService>) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        let limiter = RateLimiter::new(config.rate_limit_capacity, config.rate_limit_per_sec);

        Ok(Self {
            listener,
            handler: Arc::new(BridgeHandler::new(tools, limiter)),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process exits
    pub async fn serve(self) -> Result<(), BridgeError> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves; in-flight connections finish on their own
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.local_addr()?, "Bridge listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Bridge shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    BRIDGE_CONNECTIONS.inc();
                    let handler = Arc::clone(&self.handler);
                    let idle_timeout = self.idle_timeout;
                    let span = info_span!(
                        "bridge_connection",
                        %peer,
                        otel.name = "bridge_connection"
                    );

                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_connection(stream, handler, idle_timeout).await {
                                debug!(error = %e, "Connection ended with error");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<BridgeHandler>,
    idle_timeout: Duration,
) -> Result<(), BridgeError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        // Reads stop one byte past the cap, so an endless line never buffers
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
        let read = match tokio::time::timeout(idle_timeout, limited.read_until(b'\n', &mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!(?idle_timeout, "Closing idle connection");
                break;
            }
        };
        if read == 0 {
            break;
        }
        if buf.len() > MAX_LINE_BYTES {
            warn!(bytes = buf.len(), "Line too long, closing connection");
            BRIDGE_MALFORMED_LINES.inc();
            break;
        }

        // Invalid UTF-8 becomes a malformed line, not a dead connection
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(response) = handler.handle_line(line).await {
            let out = encode_line(&response).map_err(BridgeError::Encode)?;
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Definition, Row, ToolError};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedTools;

    #[async_trait]
    impl ToolService for FixedTools {
        async fn list_datasets(&self) -> Result<Vec<String>, ToolError> {
            Ok(vec!["despesas".into(), "receitas".into()])
        }

        async fn describe(&self, name: &str) -> Result<String, ToolError> {
            match name {
                "despesas" => Ok("CREATE TABLE despesas (valor_pago REAL)".into()),
                other => Err(ToolError::NotFound(other.into())),
            }
        }

        async fn search(&self, keyword: &str) -> Result<Vec<Definition>, ToolError> {
            Ok(vec![Definition {
                name: "despesas".into(),
                definition: format!("matched {}", keyword),
            }])
        }

        async fn run_query(&self, _query: &str) -> Result<Vec<Row>, ToolError> {
            let mut row = Row::new();
            row.insert("total".into(), json!(42));
            Ok(vec![row])
        }
    }

    fn handler(capacity: u32) -> BridgeHandler {
        BridgeHandler::new(Arc::new(FixedTools), RateLimiter::new(capacity, 0.0))
    }

    #[tokio::test]
    async fn test_dispatch_each_method() {
        let h = handler(10);

        let resp = h.handle_line(r#"{"id":1,"method":"list_datasets"}"#).await.unwrap();
        assert_eq!(resp.result, Some(json!(["despesas", "receitas"])));

        let resp = h
            .handle_line(r#"{"id":2,"method":"describe_dataset","params":{"name":"despesas"}}"#)
            .await
            .unwrap();
        assert!(resp.result.unwrap().as_str().unwrap().contains("valor_pago"));

        let resp = h
            .handle_line(r#"{"id":3,"method":"run_query","params":{"query":"SELECT 42"}}"#)
            .await
            .unwrap();
        assert_eq!(resp.result, Some(json!([{"total": 42}])));

        let resp = h
            .handle_line(r#"{"id":4,"method":"search_definitions","params":{"keyword":"edu"}}"#)
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()[0]["name"], json!("despesas"));
    }

    #[tokio::test]
    async fn test_tool_error_becomes_error_response() {
        let h = handler(10);
        let resp = h
            .handle_line(r#"{"id":"x","method":"describe_dataset","params":{"name":"nope"}}"#)
            .await
            .unwrap();
        assert_eq!(resp.id, json!("x"));
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_line_is_dropped() {
        let h = handler(10);
        assert!(h.handle_line("{not json").await.is_none());
        assert!(h.handle_line(r#"{"method":"list_datasets"}"#).await.is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_request_still_answered() {
        let h = handler(1);
        let first = h.handle_line(r#"{"id":1,"method":"list_datasets"}"#).await.unwrap();
        assert!(first.result.is_some());

        let second = h.handle_line(r#"{"id":2,"method":"list_datasets"}"#).await.unwrap();
        assert_eq!(second.id, json!(2));
        assert_eq!(second.error.unwrap().code, codes::RATE_LIMITED);
    }
}
