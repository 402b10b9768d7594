// Container models: inspected state and the configuration carried across an update

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ImageVersion;

/// Docker container state; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse from Docker API state string (e.g. "running", "exited").
    pub fn from_docker(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        self == ContainerState::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    /// "no", "always", "unless-stopped" or "on-failure".
    pub name: String,
    pub maximum_retry_count: Option<i64>,
}

/// Settings extracted from a running container that a replacement must inherit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub env: Vec<String>,
    /// Container port ("80/tcp") to host bindings.
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Volume binds in "host:container[:mode]" form.
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

/// Result of inspecting a container by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: ImageVersion,
    pub state: ContainerState,
    pub config: ContainerConfig,
}
