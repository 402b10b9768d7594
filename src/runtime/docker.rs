// ContainerRuntime over the Docker Engine API via bollard

use crate::error::RuntimeError;
use crate::models::{
    ContainerConfig, ContainerDetails, ContainerState, ImageVersion, PortBinding, RestartPolicy,
};
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, HostConfig, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    RemoveImageOptions, RenameContainerOptions, StartContainerOptions, StopContainerOptions,
};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::debug;

use super::ContainerRuntime;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform default socket.
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Round-trip to the daemon; returns its API version.
    pub async fn ping(&self) -> anyhow::Result<String> {
        self.docker.ping().await?;
        let version = self.docker.version().await?;
        Ok(version.api_version.unwrap_or_default())
    }
}

/// 404 becomes `NotFound(what)`; everything else stays a Docker error.
fn classify(err: DockerError, what: &str) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(what.to_string()),
        e => RuntimeError::Docker(e),
    }
}

/// 304 Not Modified: container already in the requested state.
fn not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let detail = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, name))?;
        details_from_inspect(name, &detail)
            .ok_or_else(|| RuntimeError::Other(format!("container {} reports no image", name)))
    }

    async fn pull(&self, image: &str) -> Result<ImageVersion, RuntimeError> {
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::Registry {
                        image: image.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        let inspected = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| classify(e, image))?;
        inspected
            .id
            .map(ImageVersion::new)
            .ok_or_else(|| RuntimeError::Other(format!("image {} has no id", image)))
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(grace.as_secs().min(i32::MAX as u64) as i32),
            ..Default::default()
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(classify(e, name)),
        }
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<(), RuntimeError> {
        let options = RenameContainerOptions {
            name: new_name.to_string(),
        };
        self.docker
            .rename_container(name, options)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn run(
        &self,
        image: &ImageVersion,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), create_body(image, config))
            .await
            .map_err(|e| classify(e, image.as_str()))?;
        for warning in &created.warnings {
            debug!(container = name, warning = %warning, "create warning");
        }
        self.start(name).await?;
        Ok(created.id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(classify(e, name)),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| classify(e, name))
    }

    async fn remove_image(&self, image: &ImageVersion) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(image.as_str(), None::<RemoveImageOptions>, None)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, image.as_str()))
    }
}

/// Map an inspect response onto our details. None when the engine reports no image id.
pub(crate) fn details_from_inspect(
    name: &str,
    detail: &ContainerInspectResponse,
) -> Option<ContainerDetails> {
    let image = detail.image.clone().filter(|i| !i.is_empty())?;
    let state = match detail.state.as_ref() {
        Some(s) if s.running == Some(true) => ContainerState::Running,
        Some(s) => s
            .status
            .as_ref()
            .map(|st| ContainerState::from_docker(&st.to_string()))
            .unwrap_or(ContainerState::Unknown),
        None => ContainerState::Unknown,
    };
    Some(ContainerDetails {
        id: detail.id.clone().unwrap_or_default(),
        name: name.to_string(),
        image: ImageVersion::new(image),
        state,
        config: extract_config(detail),
    })
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.filter(|s| !s.is_empty()).cloned()
}

pub(crate) fn extract_config(detail: &ContainerInspectResponse) -> ContainerConfig {
    let cfg = detail.config.as_ref();
    let host = detail.host_config.as_ref();

    let port_bindings = host
        .and_then(|h| h.port_bindings.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|(port, bindings)| {
                    let bindings = bindings
                        .iter()
                        .flatten()
                        .map(|b| PortBinding {
                            host_ip: non_empty(b.host_ip.as_ref()),
                            host_port: non_empty(b.host_port.as_ref()),
                        })
                        .collect();
                    (port.clone(), bindings)
                })
                .collect()
        })
        .unwrap_or_default();

    let restart_policy = host
        .and_then(|h| h.restart_policy.as_ref())
        .and_then(|p| {
            let name = p.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
            (!name.is_empty()).then(|| RestartPolicy {
                name,
                maximum_retry_count: p.maximum_retry_count.filter(|n| *n > 0),
            })
        });

    ContainerConfig {
        env: cfg.and_then(|c| c.env.clone()).unwrap_or_default(),
        port_bindings,
        binds: host.and_then(|h| h.binds.clone()).unwrap_or_default(),
        network_mode: non_empty(host.and_then(|h| h.network_mode.as_ref())),
        restart_policy,
        cmd: cfg.and_then(|c| c.cmd.clone()),
        entrypoint: cfg.and_then(|c| c.entrypoint.clone()),
        working_dir: non_empty(cfg.and_then(|c| c.working_dir.as_ref())),
        user: non_empty(cfg.and_then(|c| c.user.as_ref())),
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

pub(crate) fn create_body(image: &ImageVersion, config: &ContainerConfig) -> ContainerCreateBody {
    let port_bindings = (!config.port_bindings.is_empty()).then(|| {
        config
            .port_bindings
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|b| bollard::models::PortBinding {
                        host_ip: b.host_ip.clone(),
                        host_port: b.host_port.clone(),
                    })
                    .collect();
                (port.clone(), Some(bindings))
            })
            .collect()
    });

    let host_config = HostConfig {
        binds: (!config.binds.is_empty()).then(|| config.binds.clone()),
        port_bindings,
        network_mode: config.network_mode.clone(),
        restart_policy: config
            .restart_policy
            .as_ref()
            .map(|p| bollard::models::RestartPolicy {
                name: Some(restart_policy_name(&p.name)),
                maximum_retry_count: p.maximum_retry_count,
            }),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(image.to_string()),
        env: (!config.env.is_empty()).then(|| config.env.clone()),
        cmd: config.cmd.clone(),
        entrypoint: config.entrypoint.clone(),
        working_dir: config.working_dir.clone(),
        user: config.user.clone(),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig as DockerContainerConfig, ContainerStateStatusEnum};
    use std::collections::HashMap;

    fn inspect_response() -> ContainerInspectResponse {
        let mut ports = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some(String::new()),
                host_port: Some("8080".to_string()),
            }]),
        );
        ContainerInspectResponse {
            id: Some("c0ffee".to_string()),
            image: Some("sha256:aaaa".to_string()),
            state: Some(bollard::models::ContainerState {
                running: Some(true),
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            config: Some(DockerContainerConfig {
                env: Some(vec!["MODE=prod".to_string()]),
                cmd: Some(vec!["serve".to_string()]),
                working_dir: Some(String::new()),
                user: Some("app".to_string()),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                binds: Some(vec!["/srv/data:/data".to_string()]),
                port_bindings: Some(ports),
                network_mode: Some("bridge".to_string()),
                restart_policy: Some(bollard::models::RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: Some(0),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn details_from_inspect_extracts_identity_and_state() {
        let d = details_from_inspect("web", &inspect_response()).unwrap();
        assert_eq!(d.id, "c0ffee");
        assert_eq!(d.name, "web");
        assert_eq!(d.image, ImageVersion::new("sha256:aaaa"));
        assert!(d.state.is_running());
    }

    #[test]
    fn details_from_inspect_returns_none_without_image() {
        let mut r = inspect_response();
        r.image = None;
        assert!(details_from_inspect("web", &r).is_none());
    }

    #[test]
    fn stopped_container_state_comes_from_status() {
        let mut r = inspect_response();
        r.state = Some(bollard::models::ContainerState {
            running: Some(false),
            status: Some(ContainerStateStatusEnum::EXITED),
            ..Default::default()
        });
        let d = details_from_inspect("web", &r).unwrap();
        assert_eq!(d.state, ContainerState::Exited);
    }

    #[test]
    fn extract_config_keeps_every_carried_field() {
        let c = extract_config(&inspect_response());
        assert_eq!(c.env, vec!["MODE=prod"]);
        assert_eq!(c.cmd, Some(vec!["serve".to_string()]));
        assert_eq!(c.entrypoint, None);
        assert_eq!(c.working_dir, None);
        assert_eq!(c.user.as_deref(), Some("app"));
        assert_eq!(c.binds, vec!["/srv/data:/data"]);
        assert_eq!(c.network_mode.as_deref(), Some("bridge"));
        let policy = c.restart_policy.unwrap();
        assert_eq!(policy.name, "unless-stopped");
        assert_eq!(policy.maximum_retry_count, None);
        let binding = &c.port_bindings["80/tcp"][0];
        assert_eq!(binding.host_ip, None);
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn create_body_carries_config_over() {
        let config = extract_config(&inspect_response());
        let body = create_body(&ImageVersion::new("sha256:bbbb"), &config);
        assert_eq!(body.image.as_deref(), Some("sha256:bbbb"));
        assert_eq!(body.env, Some(vec!["MODE=prod".to_string()]));
        assert_eq!(body.user.as_deref(), Some("app"));
        let host = body.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["/srv/data:/data".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            host.restart_policy
                .and_then(|p| p.name)
                .map(|n| n.to_string())
                .as_deref(),
            Some("unless-stopped")
        );
        let ports = host.port_bindings.unwrap();
        let bindings = ports["80/tcp"].as_ref().unwrap();
        assert_eq!(bindings[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn empty_config_leaves_engine_defaults() {
        let body = create_body(&ImageVersion::new("sha256:cccc"), &ContainerConfig::default());
        assert_eq!(body.env, None);
        let host = body.host_config.unwrap();
        assert!(host.binds.is_none());
        assert!(host.port_bindings.is_none());
        assert!(host.restart_policy.is_none());
    }
}
