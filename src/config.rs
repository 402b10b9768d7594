use crate::executor::ExecutorConfig;
use crate::health::LivenessMonitor;
use crate::models::{ServiceSpec, UpdatePolicy};
use crate::window::{UpdateWindow, WindowZone};
use anyhow::Context;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identifies this node in logs and in the registry probe's User-Agent.
    pub node_id: String,
    /// Registry host probed for reachability before each check cycle.
    pub registry_url: String,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_auto_update_enabled")]
    pub auto_update_enabled: bool,
    /// Pull attempts per service per check.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    /// Directory for manual-intervention alert files; alerts are only logged when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_dir: Option<String>,
    pub update_window: UpdateWindow,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Timings of the update state machine and the driver loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_rollback_stop_grace_secs")]
    pub rollback_stop_grace_secs: u64,
    #[serde(default = "default_health_poll_interval_secs")]
    pub health_poll_interval_secs: u64,
    #[serde(default = "default_health_stabilization_secs")]
    pub health_stabilization_secs: u64,
    /// How often due deferred applies are picked up.
    #[serde(default = "default_deferred_poll_secs")]
    pub deferred_poll_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            rollback_stop_grace_secs: default_rollback_stop_grace_secs(),
            health_poll_interval_secs: default_health_poll_interval_secs(),
            health_stabilization_secs: default_health_stabilization_secs(),
            deferred_poll_secs: default_deferred_poll_secs(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    3600
}

fn default_auto_update_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_health_check_timeout_secs() -> u64 {
    300
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_rollback_stop_grace_secs() -> u64 {
    10
}

fn default_health_poll_interval_secs() -> u64 {
    5
}

fn default_health_stabilization_secs() -> u64 {
    10
}

fn default_deferred_poll_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load from `$CONFIG_FILE` (default `config.toml`). A missing file is replaced by the default
    /// configuration, which is written back so operators have something to edit.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        Self::load_or_init(&path)
    }

    pub fn load_or_init(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            return Self::load_from_path(path);
        }
        let config = Self::from_env_defaults();
        tracing::warn!(path, "config file not found; writing defaults");
        config.save(path)?;
        Ok(config)
    }

    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        Self::load_from_str(&s).with_context(|| format!("config {}", path))
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let s = toml::to_string_pretty(self)?;
        std::fs::write(path, s).with_context(|| format!("writing config {}", path))?;
        tracing::info!(path, "configuration saved");
        Ok(())
    }

    /// Defaults for a fresh node; `NODE_ID`, `REGISTRY_URL` and `UPDATE_CHECK_INTERVAL`
    /// override the built-in values.
    pub fn from_env_defaults() -> Self {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| "node-001".into());
        let registry_url =
            std::env::var("REGISTRY_URL").unwrap_or_else(|_| "registry.example.com".into());
        let check_interval_secs = std::env::var("UPDATE_CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(default_check_interval_secs);
        let window_time = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN);
        Self {
            services: vec![ServiceSpec {
                name: "app".into(),
                image: format!("{}/app:latest", registry_url),
                update_policy: UpdatePolicy::Auto,
                rollback_enabled: true,
            }],
            node_id,
            registry_url,
            check_interval_secs,
            auto_update_enabled: default_auto_update_enabled(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            alert_dir: None,
            update_window: UpdateWindow::new(window_time(2), window_time(4), WindowZone::Utc),
            executor: ExecutorSettings::default(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            stop_grace: Duration::from_secs(self.executor.stop_grace_secs),
            rollback_stop_grace: Duration::from_secs(self.executor.rollback_stop_grace_secs),
            health_timeout: Duration::from_secs(self.health_check_timeout_secs),
        }
    }

    pub fn liveness_monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(
            Duration::from_secs(self.executor.health_poll_interval_secs),
            Duration::from_secs(self.executor.health_stabilization_secs),
        )
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.node_id.is_empty(), "node_id must be non-empty");
        anyhow::ensure!(
            !self.registry_url.is_empty(),
            "registry_url must be non-empty"
        );
        anyhow::ensure!(
            self.check_interval_secs > 0,
            "check_interval_secs must be > 0, got {}",
            self.check_interval_secs
        );
        anyhow::ensure!(
            self.max_retries > 0,
            "max_retries must be > 0, got {}",
            self.max_retries
        );
        anyhow::ensure!(
            self.health_check_timeout_secs > 0,
            "health_check_timeout_secs must be > 0, got {}",
            self.health_check_timeout_secs
        );
        anyhow::ensure!(
            self.executor.health_poll_interval_secs > 0,
            "executor.health_poll_interval_secs must be > 0, got {}",
            self.executor.health_poll_interval_secs
        );
        anyhow::ensure!(
            self.executor.deferred_poll_secs > 0,
            "executor.deferred_poll_secs must be > 0, got {}",
            self.executor.deferred_poll_secs
        );
        anyhow::ensure!(
            self.update_window.start != self.update_window.end,
            "update_window.start and update_window.end must differ, both are {}",
            self.update_window.start.format("%H:%M")
        );
        let mut seen = HashSet::new();
        for service in &self.services {
            anyhow::ensure!(
                !service.name.is_empty(),
                "services[].name must be non-empty"
            );
            anyhow::ensure!(
                !service.image.is_empty(),
                "services[{}].image must be non-empty",
                service.name
            );
            anyhow::ensure!(
                seen.insert(service.name.as_str()),
                "services[].name must be unique, {} appears twice",
                service.name
            );
        }
        Ok(())
    }
}
