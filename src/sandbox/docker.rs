//! Docker Engine API client
//!
//! Talks HTTP/1.1 over the Engine's Unix socket with the same hyper +
//! hyperlocal stack used for other Unix-socket control APIs.
//!
//! ```text
//! ensure_image  GET  /images/{image}/json        (404 → POST /images/create)
//! ensure_network GET /networks/{name}            (404 → POST /networks/create)
//! create        POST /containers/create?name=…
//! upload        PUT  /containers/{id}/archive?path=/tmp
//! start         POST /containers/{id}/start
//! wait          POST /containers/{id}/wait
//! logs          GET  /containers/{id}/logs?stdout=1&stderr=1
//! remove        DELETE /containers/{id}?force=true
//! ```

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use tracing::{debug, info};

use super::api::{
    ApiMessage, ContainerCreated, ContainerWait, CreateContainer, CreateNetwork, NetworkInspect,
};
use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Default Engine socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerRuntime {
    client: HyperClient,
    socket_path: String,
}

impl DockerRuntime {
    /// Create a client for the Engine listening on `socket_path`
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Send a request and collect the whole response body
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", content_type)
            .body(Full::new(body))
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| RuntimeError::Transport(format!("{}: {}", self.socket_path, e)))?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?
            .to_bytes();

        Ok((status, bytes))
    }

    /// Like [`send`](Self::send), but non-2xx statuses (other than the
    /// ones in `tolerated`) become [`RuntimeError::Api`]
    async fn call(
        &self,
        method: Method,
        endpoint: &str,
        content_type: &str,
        body: Bytes,
        tolerated: &[StatusCode],
    ) -> Result<Bytes, RuntimeError> {
        let (status, bytes) = self.send(method.clone(), endpoint, content_type, body).await?;

        if !status.is_success() && !tolerated.contains(&status) {
            return Err(RuntimeError::Api {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                message: api_message(&bytes),
            });
        }

        Ok(bytes)
    }

    async fn call_json(&self, method: Method, endpoint: &str, body: Bytes) -> Result<Bytes, RuntimeError> {
        self.call(method, endpoint, "application/json", body, &[]).await
    }
}

fn api_message(body: &[u8]) -> String {
    serde_json::from_slice::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RuntimeError> {
    serde_json::from_slice(body).map_err(|e| RuntimeError::Decode(e.to_string()))
}

/// Split `name[:tag]` into the pull endpoint's `fromImage` and `tag`
fn split_image(image: &str) -> (&str, &str) {
    // A colon before the last slash belongs to a registry port
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Log stream demultiplexing
// ═══════════════════════════════════════════════════════════════════════════
// Without a TTY the Engine multiplexes stdout and stderr into frames:
//
//   [stream: u8][0][0][0][size: u32 BE][payload; size bytes]
//
// stream 0 = stdin, 1 = stdout, 2 = stderr. Frames are concatenated in
// arrival order, which keeps a traceback next to the prints that preceded it.
// ═══════════════════════════════════════════════════════════════════════════

/// Concatenate the payloads of a multiplexed log stream
///
/// Input that does not look multiplexed is returned as plain text.
pub fn demux_logs(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while !rest.is_empty() {
        let framed = rest.len() >= 8 && rest[0] <= 2 && rest[1..4] == [0, 0, 0];
        if !framed {
            if out.is_empty() {
                return String::from_utf8_lossy(raw).into_owned();
            }
            out.extend_from_slice(rest);
            break;
        }

        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (status, body) = self
            .send(Method::GET, &format!("/images/{}/json", image), "application/json", Bytes::new())
            .await?;

        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(RuntimeError::Api {
                method: "GET".to_string(),
                endpoint: format!("/images/{}/json", image),
                status: status.as_u16(),
                message: api_message(&body),
            });
        }

        info!(image, "Pulling sandbox image");
        let (name, tag) = split_image(image);
        let progress = self
            .call_json(
                Method::POST,
                &format!("/images/create?fromImage={}&tag={}", name, tag),
                Bytes::new(),
            )
            .await?;

        // Pull failures arrive as an `error` field inside the progress stream
        for line in progress.split(|b| *b == b'\n') {
            if let Ok(event) = serde_json::from_slice::<serde_json::Value>(line) {
                if let Some(error) = event.get("error").and_then(|e| e.as_str()) {
                    return Err(RuntimeError::Pull(error.to_string()));
                }
            }
        }

        info!(image, "Sandbox image ready");
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let endpoint = format!("/networks/{}", name);
        let (status, body) = self
            .send(Method::GET, &endpoint, "application/json", Bytes::new())
            .await?;

        if status.is_success() {
            let network: NetworkInspect = decode(&body)?;
            if !network.internal {
                return Err(RuntimeError::NetworkNotInternal(network.name));
            }
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(RuntimeError::Api {
                method: "GET".to_string(),
                endpoint,
                status: status.as_u16(),
                message: api_message(&body),
            });
        }

        let json = serde_json::to_vec(&CreateNetwork::internal(name))
            .map_err(|e| RuntimeError::Decode(e.to_string()))?;
        self.call_json(Method::POST, "/networks/create", Bytes::from(json)).await?;
        info!(network = name, "Created internal sandbox network");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let payload = CreateContainer::from(spec);
        let json = serde_json::to_vec(&payload).map_err(|e| RuntimeError::Decode(e.to_string()))?;

        let body = self
            .call_json(
                Method::POST,
                &format!("/containers/create?name={}", spec.name),
                Bytes::from(json),
            )
            .await?;
        let created: ContainerCreated = decode(&body)?;

        for warning in created.warnings.unwrap_or_default() {
            debug!(container = %created.id, warning = %warning, "Runtime warning");
        }

        Ok(created.id)
    }

    async fn upload(&self, id: &str, dir: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.call(
            Method::PUT,
            &format!("/containers/{}/archive?path={}", id, dir),
            "application/x-tar",
            Bytes::from(archive),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.call(
            Method::POST,
            &format!("/containers/{}/start", id),
            "application/json",
            Bytes::new(),
            &[StatusCode::NOT_MODIFIED],
        )
        .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let body = self
            .call_json(Method::POST, &format!("/containers/{}/wait", id), Bytes::new())
            .await?;
        let wait: ContainerWait = decode(&body)?;

        if let Some(error) = wait.error.filter(|e| !e.message.is_empty()) {
            return Err(RuntimeError::Decode(error.message));
        }

        Ok(wait.status_code)
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        let body = self
            .call_json(
                Method::GET,
                &format!("/containers/{}/logs?stdout=1&stderr=1", id),
                Bytes::new(),
            )
            .await?;
        Ok(demux_logs(&body))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.call(
            Method::DELETE,
            &format!("/containers/{}?force=true", id),
            "application/json",
            Bytes::new(),
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }
}
