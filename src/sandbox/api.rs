//! Docker Engine API payloads
//!
//! Only the fields the sandbox sets or reads. Field names follow the Engine
//! API's PascalCase.

use serde::{Deserialize, Serialize};

use super::runtime::ContainerSpec;

/// Network mode of a container with no interfaces besides loopback
pub const NO_NETWORK: &str = "none";

/// `POST /containers/create` body
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub open_stdin: bool,
    pub host_config: HostConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub memory: i64,
    pub memory_swap: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub auto_remove: bool,
}

impl From<&ContainerSpec> for CreateContainer {
    fn from(spec: &ContainerSpec) -> Self {
        let memory = i64::try_from(spec.limits.memory_bytes).unwrap_or(i64::MAX);
        let network_mode = spec.network.clone().unwrap_or_else(|| NO_NETWORK.to_string());

        Self {
            image: spec.image.clone(),
            cmd: spec.cmd.clone(),
            env: spec.env.clone(),
            tty: false,
            attach_stdin: false,
            open_stdin: false,
            host_config: HostConfig {
                memory,
                memory_swap: memory,
                nano_cpus: spec.limits.nano_cpus(),
                pids_limit: spec.limits.pids_limit,
                network_mode,
                cap_drop: vec!["ALL".to_string()],
                security_opt: vec!["no-new-privileges".to_string()],
                // Removal is ours to do, after the logs are read
                auto_remove: false,
            },
        }
    }
}

/// `POST /networks/create` body
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetwork {
    pub name: String,
    pub driver: String,
    /// No route out of the network; members only reach each other
    pub internal: bool,
}

impl CreateNetwork {
    pub fn internal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: "bridge".to_string(),
            internal: true,
        }
    }
}

/// `GET /networks/{name}` response
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInspect {
    pub name: String,
    #[serde(default)]
    pub internal: bool,
}

/// `POST /containers/create` response
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreated {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// `POST /containers/{id}/wait` response
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerWait {
    pub status_code: i64,
    #[serde(default)]
    pub error: Option<WaitError>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct WaitError {
    #[serde(default)]
    pub message: String,
}

/// Error body returned by the Engine API on non-2xx responses
#[derive(Deserialize, Debug, Clone)]
pub struct ApiMessage {
    pub message: String,
}
