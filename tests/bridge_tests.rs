//! Integration tests for the bridge
//!
//! A real server on an ephemeral port in front of a SQLite fixture; requests
//! go through raw sockets (as the sandbox preamble sends them) and through
//! the Rust client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use civic_audit::bridge::{codes, BridgeClient, BridgeConfig, BridgeServer};
use civic_audit::tools::{DatabaseConfig, SqliteToolService, ToolError, ToolService};

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn audit_db() -> (TempDir, DatabaseConfig) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("civic_audit.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE despesas (
            id TEXT PRIMARY KEY,
            orgao TEXT,
            mes_referencia TEXT,
            valor_pago REAL
         );
         CREATE TABLE licitacoes (numero TEXT PRIMARY KEY, objeto TEXT, valor_estimado REAL);
         INSERT INTO despesas VALUES ('1', 'Saude', '202401', 1000.5);
         INSERT INTO despesas VALUES ('2', 'Educacao', '202401', 2000.0);
         INSERT INTO despesas VALUES ('3', 'Saude', '202402', 300.0);
         INSERT INTO licitacoes VALUES ('PE-01/2024', 'Merenda escolar', 50000.0);",
    )
    .unwrap();
    drop(conn);

    let config = DatabaseConfig {
        path,
        max_rows: 100,
    };
    (dir, config)
}

async fn start_bridge(config: BridgeConfig) -> (TempDir, SocketAddr) {
    let (dir, db) = audit_db();
    let tools: Arc<dyn ToolService> = Arc::new(SqliteToolService::open(&db).unwrap());
    let server = BridgeServer::bind(&config, tools).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (dir, addr)
}

fn local_config() -> BridgeConfig {
    BridgeConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..BridgeConfig::default()
    }
}

struct RawConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawConnection {
    async fn open(addr: SocketAddr) -> Self {
        let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.reader.read_line(&mut line),
        )
        .await
        .expect("response within 5s")
        .unwrap();
        assert!(n > 0, "connection closed without a response");
        serde_json::from_str(&line).unwrap()
    }
}

/// Exactly one of `result` / `error`
fn assert_well_formed(response: &Value) {
    let has_result = response.get("result").is_some();
    let has_error = response.get("error").is_some();
    assert!(has_result != has_error, "malformed response: {}", response);
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire contract
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_ids_are_echoed_with_one_outcome() {
    let (_db, addr) = start_bridge(local_config()).await;
    let mut conn = RawConnection::open(addr).await;

    let requests = [
        (json!(7), r#"{"id": 7, "method": "list_datasets"}"#),
        (json!("abc"), r#"{"id": "abc", "method": "describe_dataset", "params": {"name": "despesas"}}"#),
        (json!(9), r#"{"id": 9, "method": "describe_dataset", "params": {"name": "nope"}}"#),
        (json!(10), r#"{"id": 10, "method": "no_such_method"}"#),
        (json!(11), r#"{"id": 11, "method": "run_query"}"#),
    ];

    for (id, line) in requests {
        conn.send(line).await;
        let response = conn.recv().await;
        assert_eq!(response["id"], id);
        assert_well_formed(&response);
    }
}

#[tokio::test]
async fn test_methods_reach_the_tool_service() {
    let (_db, addr) = start_bridge(local_config()).await;
    let mut conn = RawConnection::open(addr).await;

    conn.send(r#"{"id": 1, "method": "list_datasets"}"#).await;
    assert_eq!(conn.recv().await["result"], json!(["despesas", "licitacoes"]));

    conn.send(
        r#"{"id": 2, "method": "run_query", "params": {"query": "SELECT SUM(valor_pago) AS total FROM despesas WHERE mes_referencia = '202401'"}}"#,
    )
    .await;
    assert_eq!(conn.recv().await["result"], json!([{ "total": 3000.5 }]));

    conn.send(r#"{"id": 3, "method": "search_definitions", "params": {"keyword": "objeto"}}"#)
        .await;
    let found = conn.recv().await;
    assert_eq!(found["result"][0]["name"], "licitacoes");
}

#[tokio::test]
async fn test_error_codes() {
    let (_db, addr) = start_bridge(local_config()).await;
    let mut conn = RawConnection::open(addr).await;

    conn.send(r#"{"id": 1, "method": "drop_everything"}"#).await;
    assert_eq!(conn.recv().await["error"]["code"], codes::METHOD_NOT_FOUND);

    conn.send(r#"{"id": 2, "method": "describe_dataset", "params": {}}"#).await;
    assert_eq!(conn.recv().await["error"]["code"], codes::INVALID_PARAMS);

    conn.send(r#"{"id": 3, "method": "describe_dataset", "params": {"name": "missing"}}"#)
        .await;
    assert_eq!(conn.recv().await["error"]["code"], codes::NOT_FOUND);

    conn.send(r#"{"id": 4, "method": "run_query", "params": {"query": "DELETE FROM despesas"}}"#)
        .await;
    assert_eq!(conn.recv().await["error"]["code"], codes::REJECTED);

    conn.send(r#"{"id": 5, "params": {}}"#).await;
    assert_eq!(conn.recv().await["error"]["code"], codes::INVALID_REQUEST);
}

#[tokio::test]
async fn test_malformed_lines_get_no_response_and_server_survives() {
    let (_db, addr) = start_bridge(local_config()).await;
    let mut conn = RawConnection::open(addr).await;

    conn.send("this is not json").await;
    conn.send(r#"{"method": "list_datasets"}"#).await;
    conn.send("[1, 2, 3]").await;
    conn.send(r#"{"id": 42, "method": "list_datasets"}"#).await;

    // The first line back answers the only attributable request
    let response = conn.recv().await;
    assert_eq!(response["id"], 42);
    assert_well_formed(&response);

    // A fresh connection still works
    let client = BridgeClient::new(addr.to_string());
    let datasets = client.list_datasets().await.unwrap();
    assert_eq!(datasets.len(), 2);
}

#[tokio::test]
async fn test_endless_line_closes_the_connection() {
    let (_db, addr) = start_bridge(local_config()).await;
    let (mut reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();

    // Well past the 1 MiB line cap, never terminated
    tokio::spawn(async move {
        let chunk = vec![b'x'; 64 * 1024];
        for _ in 0..32 {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
        // Keep the write half open so only the server can end the connection
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    });

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest),
    )
    .await
    .expect("server closes the connection at the line cap");
    // A reset is also a close: unread bytes were still queued server-side
    if closed.is_ok() {
        assert!(rest.is_empty());
    }

    let client = BridgeClient::new(addr.to_string());
    assert_eq!(client.list_datasets().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (_db, addr) = start_bridge(local_config()).await;
    let mut conn = RawConnection::open(addr).await;

    for id in 0..10 {
        conn.send(&format!(r#"{{"id": {}, "method": "list_datasets"}}"#, id))
            .await;
    }
    for id in 0..10 {
        assert_eq!(conn.recv().await["id"], id);
    }
}

#[tokio::test]
async fn test_rate_limit_still_answers_every_request() {
    let config = BridgeConfig {
        rate_limit_capacity: 2,
        rate_limit_per_sec: 0.001,
        ..local_config()
    };
    let (_db, addr) = start_bridge(config).await;
    let mut conn = RawConnection::open(addr).await;

    let mut limited = 0;
    for id in 0..4 {
        conn.send(&format!(r#"{{"id": {}, "method": "list_datasets"}}"#, id))
            .await;
        let response = conn.recv().await;
        assert_eq!(response["id"], id);
        assert_well_formed(&response);
        if response["error"]["code"] == codes::RATE_LIMITED {
            limited += 1;
        }
    }
    assert_eq!(limited, 2);
}

// ═══════════════════════════════════════════════════════════════════════════
// Rust client
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_client_as_tool_service() {
    let (_db, addr) = start_bridge(local_config()).await;
    let client = BridgeClient::new(addr.to_string());

    let ddl = client.describe("despesas").await.unwrap();
    assert!(ddl.contains("valor_pago"));

    let rows = client
        .run_query("SELECT orgao, SUM(valor_pago) AS total FROM despesas GROUP BY orgao ORDER BY orgao")
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["orgao"], "Educacao");

    let err = client.describe("missing").await.unwrap_err();
    assert!(matches!(
        err,
        ToolError::Remote { code, .. } if code == codes::NOT_FOUND
    ));
}

#[tokio::test]
async fn test_persistent_client_reuses_one_connection() {
    let (_db, addr) = start_bridge(local_config()).await;
    let client = BridgeClient::new(addr.to_string()).persistent();

    for _ in 0..5 {
        assert_eq!(client.list_datasets().await.unwrap().len(), 2);
    }
    // An error response does not poison the connection
    assert!(client.describe("missing").await.is_err());
    assert_eq!(client.list_datasets().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_many_concurrent_connections() {
    let (_db, addr) = start_bridge(local_config()).await;
    let client = BridgeClient::new(addr.to_string());

    let results = join_all((0..20).map(|_| client.list_datasets())).await;
    for result in results {
        assert_eq!(result.unwrap().len(), 2);
    }
}
