// Shared test helpers: an in-memory container runtime with failure injection

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use update_agent::config::AppConfig;
use update_agent::connectivity::RegistryProbe;
use update_agent::error::RuntimeError;
use update_agent::executor::{ExecutorConfig, UpdateExecutor};
use update_agent::health::LivenessMonitor;
use update_agent::models::{
    ContainerConfig, ContainerDetails, ContainerState, ImageVersion, PortBinding, RestartPolicy,
    ServiceSpec, UpdatePolicy,
};
use update_agent::runtime::ContainerRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Inspect,
    Pull,
    Stop,
    Rename,
    Run,
    Start,
    Remove,
    RemoveImage,
}

impl Op {
    pub fn mutates(self) -> bool {
        !matches!(self, Op::Inspect | Op::Pull)
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub image: ImageVersion,
    pub running: bool,
    pub config: ContainerConfig,
}

struct Failure {
    op: Op,
    target: String,
    prefix: bool,
    /// The operation takes effect, then the call still fails (lost reply).
    after: bool,
}

impl Failure {
    fn hits(&self, op: Op, target: &str, after: bool) -> bool {
        self.op == op
            && self.after == after
            && if self.prefix {
                target.starts_with(&self.target)
            } else {
                target == self.target
            }
    }
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, FakeContainer>,
    /// Image reference -> what a pull resolves to.
    registry: BTreeMap<String, ImageVersion>,
    local_images: BTreeSet<ImageVersion>,
    /// Containers from these images exit right after starting.
    crashing: BTreeSet<ImageVersion>,
    failures: Vec<Failure>,
    calls: Vec<(Op, String)>,
    next_id: u32,
}

impl Inner {
    fn call(&mut self, op: Op, target: &str) -> Result<(), RuntimeError> {
        self.calls.push((op, target.to_string()));
        self.check(op, target, false)
    }

    fn check(&self, op: Op, target: &str, after: bool) -> Result<(), RuntimeError> {
        if self.failures.iter().any(|f| f.hits(op, target, after)) {
            Err(RuntimeError::Other(format!("injected {:?} failure on {}", op, target)))
        } else {
            Ok(())
        }
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("c{:04}", self.next_id)
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// A running container `name` on `image`, with a representative config.
    pub fn with_container(self, name: &str, image: &str) -> Self {
        {
            let mut inner = self.lock();
            let id = inner.id();
            inner.local_images.insert(ImageVersion::new(image));
            inner.containers.insert(
                name.to_string(),
                FakeContainer {
                    id,
                    image: ImageVersion::new(image),
                    running: true,
                    config: sample_config(),
                },
            );
        }
        self
    }

    /// Make pulls of `reference` resolve to `image`.
    pub fn publish(&self, reference: &str, image: &str) {
        self.lock()
            .registry
            .insert(reference.to_string(), ImageVersion::new(image));
    }

    pub fn fail(&self, op: Op, target: &str) {
        self.lock().failures.push(Failure {
            op,
            target: target.to_string(),
            prefix: false,
            after: false,
        });
    }

    pub fn fail_prefix(&self, op: Op, prefix: &str) {
        self.lock().failures.push(Failure {
            op,
            target: prefix.to_string(),
            prefix: true,
            after: false,
        });
    }

    /// `op` on `target` is carried out but reported as failed. Honored by `rename`.
    pub fn fail_after_effect(&self, op: Op, target: &str) {
        self.lock().failures.push(Failure {
            op,
            target: target.to_string(),
            prefix: false,
            after: true,
        });
    }

    /// Make `image` present locally without going through a pull.
    pub fn add_local_image(&self, image: &str) {
        self.lock().local_images.insert(ImageVersion::new(image));
    }

    pub fn crash_on(&self, image: &str) {
        self.lock().crashing.insert(ImageVersion::new(image));
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.lock().containers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn backups_of(&self, service: &str) -> Vec<String> {
        let prefix = format!("{}_backup_", service);
        self.names()
            .into_iter()
            .filter(|n| n.starts_with(&prefix))
            .collect()
    }

    pub fn has_local_image(&self, image: &str) -> bool {
        self.lock().local_images.contains(&ImageVersion::new(image))
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn mutations(&self) -> Vec<(Op, String)> {
        self.calls().into_iter().filter(|(op, _)| op.mutates()).collect()
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Inspect, name)?;
        let c = inner
            .containers
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: name.to_string(),
            image: c.image.clone(),
            state: if c.running {
                ContainerState::Running
            } else {
                ContainerState::Exited
            },
            config: c.config.clone(),
        })
    }

    async fn pull(&self, image: &str) -> Result<ImageVersion, RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Pull, image).map_err(|e| RuntimeError::Registry {
            image: image.to_string(),
            message: e.to_string(),
        })?;
        let version = inner
            .registry
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::Registry {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            })?;
        inner.local_images.insert(version.clone());
        Ok(version)
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Stop, name)?;
        let c = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        c.running = false;
        Ok(())
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Rename, name)?;
        if inner.containers.contains_key(new_name) {
            return Err(RuntimeError::Other(format!("name {} already in use", new_name)));
        }
        let c = inner
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        inner.containers.insert(new_name.to_string(), c);
        inner.check(Op::Rename, name, true)
    }

    async fn run(
        &self,
        image: &ImageVersion,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<String, RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Run, name)?;
        if inner.containers.contains_key(name) {
            return Err(RuntimeError::Other(format!("name {} already in use", name)));
        }
        if !inner.local_images.contains(image) {
            return Err(RuntimeError::NotFound(image.to_string()));
        }
        let id = inner.id();
        let running = !inner.crashing.contains(image);
        inner.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                image: image.clone(),
                running,
                config: config.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Start, name)?;
        let crashing = inner.crashing.clone();
        let c = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        c.running = !crashing.contains(&c.image);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::Remove, name)?;
        inner
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn remove_image(&self, image: &ImageVersion) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        inner.call(Op::RemoveImage, image.as_str())?;
        if inner.containers.values().any(|c| &c.image == image) {
            return Err(RuntimeError::Other(format!("image {} is in use", image)));
        }
        inner.local_images.remove(image);
        Ok(())
    }
}

pub struct StaticProbe(pub bool);

impl RegistryProbe for StaticProbe {
    async fn reachable(&self) -> bool {
        self.0
    }
}

pub fn sample_config() -> ContainerConfig {
    let mut port_bindings = BTreeMap::new();
    port_bindings.insert(
        "80/tcp".to_string(),
        vec![PortBinding {
            host_ip: None,
            host_port: Some("8080".to_string()),
        }],
    );
    ContainerConfig {
        env: vec!["MODE=prod".to_string()],
        port_bindings,
        binds: vec!["/srv/web:/data".to_string()],
        network_mode: Some("bridge".to_string()),
        restart_policy: Some(RestartPolicy {
            name: "unless-stopped".to_string(),
            maximum_retry_count: None,
        }),
        cmd: Some(vec!["serve".to_string()]),
        entrypoint: None,
        working_dir: Some("/app".to_string()),
        user: Some("app".to_string()),
    }
}

pub fn service(name: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: format!("registry.example.com/{}:latest", name),
        update_policy: UpdatePolicy::Auto,
        rollback_enabled: true,
    }
}

pub fn fast_monitor() -> LivenessMonitor {
    LivenessMonitor::new(Duration::from_millis(5), Duration::from_millis(5))
}

pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        stop_grace: Duration::from_secs(1),
        rollback_stop_grace: Duration::from_secs(1),
        health_timeout: Duration::from_millis(60),
    }
}

pub fn executor(
    runtime: std::sync::Arc<FakeRuntime>,
) -> UpdateExecutor<FakeRuntime, LivenessMonitor> {
    UpdateExecutor::new(runtime, fast_monitor(), fast_executor_config())
}

/// Config with two auto services and a 02:00-04:00 UTC window; `extra` is appended verbatim.
pub fn test_config(extra: &str) -> AppConfig {
    let s = format!(
        r#"
node_id = "node-test"
registry_url = "registry.example.com"
check_interval_secs = 3600
auto_update_enabled = true
max_retries = 3
retry_delay_secs = 0
health_check_timeout_secs = 1
{extra}

[update_window]
start = "02:00"
end = "04:00"
timezone = "UTC"

[executor]
stop_grace_secs = 1
rollback_stop_grace_secs = 1
health_poll_interval_secs = 1
health_stabilization_secs = 0
deferred_poll_secs = 1

[[services]]
name = "web"
image = "registry.example.com/web:latest"
update_policy = "auto"
rollback_enabled = true

[[services]]
name = "api"
image = "registry.example.com/api:latest"
"#
    );
    AppConfig::load_from_str(&s).unwrap()
}
