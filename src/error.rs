// Error taxonomy for runtime calls and update attempts

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::executor::AttemptState;
use crate::models::ImageVersion;

/// Failure of a single container runtime operation.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container or image: {0}")]
    NotFound(String),
    #[error("pull of {image} failed: {message}")]
    Registry { image: String, message: String },
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Per-service failure kinds; inspected by the cycle driver, never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("registry {registry} unreachable")]
    ConnectivityUnavailable { registry: String },
    #[error("container {service} not found")]
    ServiceNotFound { service: String },
    #[error("inspect of {service} failed: {source}")]
    Runtime {
        service: String,
        #[source]
        source: RuntimeError,
    },
    #[error("pull of {image} failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: RuntimeError,
    },
    #[error("backup of {service} failed: {source}")]
    BackupFailure {
        service: String,
        #[source]
        source: RuntimeError,
    },
    #[error("start of new {service} container failed: {source}")]
    StartFailure {
        service: String,
        #[source]
        source: RuntimeError,
    },
    #[error("{service} not healthy within {}s", .timeout.as_secs())]
    HealthTimeout { service: String, timeout: Duration },
    #[error("{0}")]
    ManualIntervention(Box<ManualIntervention>),
    #[error("update of {service} already in progress")]
    AttemptInProgress { service: String },
    #[error("{service} is quarantined after a failed rollback")]
    Quarantined { service: String },
}

impl UpdateError {
    /// Non-recoverable: the service needs an operator before it is touched again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpdateError::ManualIntervention(_))
    }

    /// Worth trying again within the same check (network/registry hiccups).
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::Pull { .. } | UpdateError::Runtime { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::ConnectivityUnavailable { .. } => "connectivity_unavailable",
            UpdateError::ServiceNotFound { .. } => "service_not_found",
            UpdateError::Runtime { .. } => "runtime_error",
            UpdateError::Pull { .. } => "pull_error",
            UpdateError::BackupFailure { .. } => "backup_failure",
            UpdateError::StartFailure { .. } => "start_failure",
            UpdateError::HealthTimeout { .. } => "health_timeout",
            UpdateError::ManualIntervention(_) => "rollback_failure",
            UpdateError::AttemptInProgress { .. } => "attempt_in_progress",
            UpdateError::Quarantined { .. } => "quarantined",
        }
    }
}

/// Operator alert raised when an attempt cannot restore the prior container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualIntervention {
    pub service: String,
    /// Name the service's container should carry; may be absent, stopped or the failed new one.
    pub canonical_name: String,
    /// Renamed prior container, if the attempt got that far.
    pub backup_name: Option<String>,
    pub old_image: ImageVersion,
    pub new_image: ImageVersion,
    /// Last state the attempt reached before giving up.
    pub last_state: AttemptState,
    pub reason: String,
}

impl fmt::Display for ManualIntervention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manual intervention required for {}: {} (canonical container: {}, backup container: {}, last state: {:?})",
            self.service,
            self.reason,
            self.canonical_name,
            self.backup_name.as_deref().unwrap_or("<none>"),
            self.last_state
        )
    }
}
