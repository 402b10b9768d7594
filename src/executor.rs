// Guarded update of one service: stop -> backup -> start -> health check -> commit or rollback.
//
// Renaming the old container to its backup name is the point of no return. Anything that fails
// before the rename leaves the service as it was; anything after it either commits or restores
// the backup under the canonical name. A restore that fails is escalated to the operator and the
// attempt is never retried automatically.

use crate::error::{ManualIntervention, RuntimeError, UpdateError};
use crate::health::HealthCheck;
use crate::models::{ImageVersion, ServiceSpec};
use crate::runtime::ContainerRuntime;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    BackingUp,
    Starting,
    HealthChecking,
    Committed,
    RollingBack,
    RolledBack,
    FatalManualIntervention,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Committed | AttemptState::RolledBack | AttemptState::FatalManualIntervention
        )
    }

    /// Edges of the attempt state machine.
    pub fn can_advance_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Idle, BackingUp)
                | (BackingUp, Idle)
                | (BackingUp, Starting)
                | (BackingUp, FatalManualIntervention)
                | (Starting, HealthChecking)
                | (Starting, RollingBack)
                | (Starting, FatalManualIntervention)
                | (HealthChecking, Committed)
                | (HealthChecking, RollingBack)
                | (HealthChecking, FatalManualIntervention)
                | (RollingBack, RolledBack)
                | (RollingBack, FatalManualIntervention)
        )
    }
}

/// In-memory record of one apply; dropped when the attempt ends.
#[derive(Debug, Clone)]
pub struct UpdateAttempt {
    pub service: String,
    pub old_image: ImageVersion,
    pub new_image: ImageVersion,
    pub backup_name: Option<String>,
    pub state: AttemptState,
}

impl UpdateAttempt {
    fn new(service: &str, old_image: ImageVersion, new_image: ImageVersion) -> Self {
        Self {
            service: service.to_string(),
            old_image,
            new_image,
            backup_name: None,
            state: AttemptState::Idle,
        }
    }

    fn advance(&mut self, next: AttemptState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        info!(
            service = %self.service,
            from = ?self.state,
            to = ?next,
            old_image = %self.old_image.short(),
            new_image = %self.new_image.short(),
            "attempt transition"
        );
        self.state = next;
    }

    fn escalate(&self, reason: String) -> ManualIntervention {
        ManualIntervention {
            service: self.service.clone(),
            canonical_name: self.service.clone(),
            backup_name: self.backup_name.clone(),
            old_image: self.old_image.clone(),
            new_image: self.new_image.clone(),
            last_state: self.state,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub old_image: ImageVersion,
    pub new_image: ImageVersion,
    pub backup_removed: bool,
    pub old_image_removed: bool,
}

/// Terminal outcome of an attempt that did not need an operator.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Committed: the new image is running under the canonical name.
    Applied(AppliedUpdate),
    /// The running container already uses the target image.
    UpToDate,
    /// The old container is back under the canonical name; nothing changed.
    AbortedNoChange(UpdateError),
    /// The new container failed; the prior one runs again under the canonical name.
    RolledBack {
        cause: UpdateError,
        backup_name: String,
    },
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub stop_grace: Duration,
    pub rollback_stop_grace: Duration,
    pub health_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(30),
            rollback_stop_grace: Duration::from_secs(10),
            health_timeout: Duration::from_secs(300),
        }
    }
}

/// Backup name for `service` at `unix_secs`; `attempt` > 0 disambiguates collisions.
pub fn backup_name(service: &str, unix_secs: i64, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}_backup_{}", service, unix_secs)
    } else {
        format!("{}_backup_{}_{}", service, unix_secs, attempt)
    }
}

/// Marks a service as having an attempt in flight until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    service: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.service);
    }
}

pub struct UpdateExecutor<R, H> {
    runtime: Arc<R>,
    health: H,
    config: ExecutorConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl<R: ContainerRuntime, H: HealthCheck> UpdateExecutor<R, H> {
    pub fn new(runtime: Arc<R>, health: H, config: ExecutorConfig) -> Self {
        Self {
            runtime,
            health,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn is_in_flight(&self, service: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(service)
    }

    fn begin(&self, service: &str) -> Result<InFlight<'_>, UpdateError> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(service.to_string()) {
            return Err(UpdateError::AttemptInProgress {
                service: service.to_string(),
            });
        }
        Ok(InFlight {
            set: &self.in_flight,
            service: service.to_string(),
        })
    }

    /// Replace the running container of `service` with one on `target`.
    ///
    /// `Ok` covers every outcome that leaves the service running under its canonical name.
    /// `Err` is either a rejected call (`AttemptInProgress`) or a fatal
    /// `ManualIntervention` that must reach an operator.
    pub async fn apply(
        &self,
        service: &ServiceSpec,
        target: &ImageVersion,
    ) -> Result<ApplyOutcome, UpdateError> {
        let _guard = self.begin(&service.name)?;
        let span = tracing::info_span!("apply", service = %service.name, target_image = %target.short());
        self.run_attempt(service, target).instrument(span).await
    }

    async fn run_attempt(
        &self,
        service: &ServiceSpec,
        target: &ImageVersion,
    ) -> Result<ApplyOutcome, UpdateError> {
        let name = service.name.as_str();
        let current = match self.runtime.inspect(name).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                return Ok(ApplyOutcome::AbortedNoChange(UpdateError::ServiceNotFound {
                    service: name.to_string(),
                }));
            }
            Err(source) => {
                return Ok(ApplyOutcome::AbortedNoChange(UpdateError::BackupFailure {
                    service: name.to_string(),
                    source,
                }));
            }
        };
        if &current.image == target {
            info!(image = %target.short(), "already on target image");
            return Ok(ApplyOutcome::UpToDate);
        }

        let mut attempt = UpdateAttempt::new(name, current.image.clone(), target.clone());
        attempt.advance(AttemptState::BackingUp);
        if let Err(e) = self.back_up(&mut attempt).await {
            if e.is_fatal() {
                return Err(e);
            }
            attempt.advance(AttemptState::Idle);
            warn!(error = %e, "update aborted before backup; service unchanged");
            return Ok(ApplyOutcome::AbortedNoChange(e));
        }

        attempt.advance(AttemptState::Starting);
        if let Err(source) = self.runtime.run(target, name, &current.config).await {
            let cause = UpdateError::StartFailure {
                service: name.to_string(),
                source,
            };
            return self.recover(service, attempt, cause).await;
        }

        attempt.advance(AttemptState::HealthChecking);
        let timeout = self.config.health_timeout;
        if !self.health.wait_healthy(&*self.runtime, name, timeout).await {
            let cause = UpdateError::HealthTimeout {
                service: name.to_string(),
                timeout,
            };
            return self.recover(service, attempt, cause).await;
        }

        attempt.advance(AttemptState::Committed);
        Ok(ApplyOutcome::Applied(self.commit(&attempt).await))
    }

    /// Stop the running container and rename it out of the way.
    async fn back_up(&self, attempt: &mut UpdateAttempt) -> Result<(), UpdateError> {
        let name = attempt.service.clone();
        let backup = self.free_backup_name(&name).await;
        let failure = |source: RuntimeError| UpdateError::BackupFailure {
            service: name.clone(),
            source,
        };

        if let Err(e) = self.runtime.stop(&name, self.config.stop_grace).await {
            self.restart_original(&name).await;
            return Err(failure(e));
        }
        if let Err(e) = self.runtime.rename(&name, &backup).await {
            return Err(self.unwind_rename(attempt, &backup, failure(e)).await);
        }
        info!(backup = %backup, "previous container preserved");
        attempt.backup_name = Some(backup);
        Ok(())
    }

    /// A failed rename may still have taken effect on the engine. Find out which name the old
    /// container carries and put it back under the canonical name, or escalate.
    async fn unwind_rename(
        &self,
        attempt: &mut UpdateAttempt,
        backup: &str,
        cause: UpdateError,
    ) -> UpdateError {
        let name = attempt.service.clone();
        if self.runtime.inspect(backup).await.is_ok() {
            warn!(backup, error = %cause, "rename reported failure but took effect; restoring");
            attempt.backup_name = Some(backup.to_string());
            let restored = match self.runtime.rename(backup, &name).await {
                Ok(()) => self
                    .runtime
                    .start(&name)
                    .await
                    .map_err(|e| format!("start restored {}: {}", name, e)),
                Err(e) => Err(format!("rename {} -> {}: {}", backup, name, e)),
            };
            return match restored {
                Ok(()) => {
                    attempt.backup_name = None;
                    cause
                }
                Err(reason) => self.abandon_backup(attempt, &cause, &reason),
            };
        }
        match self.runtime.inspect(&name).await {
            Ok(_) => {
                self.restart_original(&name).await;
                cause
            }
            Err(e) => {
                let reason = format!("container found under neither {} nor {}: {}", name, backup, e);
                self.abandon_backup(attempt, &cause, &reason)
            }
        }
    }

    fn abandon_backup(
        &self,
        attempt: &mut UpdateAttempt,
        cause: &UpdateError,
        reason: &str,
    ) -> UpdateError {
        let alert = attempt.escalate(format!("{}; restore after failed backup: {}", cause, reason));
        attempt.advance(AttemptState::FatalManualIntervention);
        self.raise(alert)
    }

    /// First backup name for `service` not already taken by a container.
    async fn free_backup_name(&self, service: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut n = 0;
        loop {
            let candidate = backup_name(service, now, n);
            match self.runtime.inspect(&candidate).await {
                Err(e) if e.is_not_found() => return candidate,
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "backup name lookup failed; using it");
                    return candidate;
                }
                Ok(_) => n += 1,
            }
        }
    }

    async fn restart_original(&self, name: &str) {
        if let Err(e) = self.runtime.start(name).await {
            warn!(error = %e, "could not restart original container after aborted backup");
        }
    }

    async fn commit(&self, attempt: &UpdateAttempt) -> AppliedUpdate {
        let backup_removed = match attempt.backup_name.as_deref() {
            Some(backup) => match self.runtime.remove(backup).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(backup, error = %e, "backup container not removed");
                    false
                }
            },
            None => false,
        };
        let old_image_removed = attempt.old_image != attempt.new_image
            && match self.runtime.remove_image(&attempt.old_image).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(image = %attempt.old_image.short(), error = %e, "old image kept");
                    false
                }
            };
        info!(
            old_image = %attempt.old_image.short(),
            new_image = %attempt.new_image.short(),
            "update applied"
        );
        AppliedUpdate {
            old_image: attempt.old_image.clone(),
            new_image: attempt.new_image.clone(),
            backup_removed,
            old_image_removed,
        }
    }

    async fn recover(
        &self,
        service: &ServiceSpec,
        mut attempt: UpdateAttempt,
        cause: UpdateError,
    ) -> Result<ApplyOutcome, UpdateError> {
        if !service.rollback_enabled {
            let alert = attempt.escalate(format!("{}; rollback disabled for this service", cause));
            attempt.advance(AttemptState::FatalManualIntervention);
            return Err(self.raise(alert));
        }

        warn!(error = %cause, "rolling back");
        attempt.advance(AttemptState::RollingBack);
        match self.roll_back(&attempt).await {
            Ok(backup_name) => {
                attempt.advance(AttemptState::RolledBack);
                info!(image = %attempt.old_image.short(), "rolled back to previous container");
                Ok(ApplyOutcome::RolledBack { cause, backup_name })
            }
            Err(reason) => {
                let alert = attempt.escalate(format!("{}; rollback failed: {}", cause, reason));
                attempt.advance(AttemptState::FatalManualIntervention);
                Err(self.raise(alert))
            }
        }
    }

    /// Clear the canonical name and put the backup back under it. Returns the backup name used.
    async fn roll_back(&self, attempt: &UpdateAttempt) -> Result<String, String> {
        let name = attempt.service.as_str();
        let backup = attempt
            .backup_name
            .clone()
            .ok_or_else(|| "no backup container recorded".to_string())?;

        if let Err(e) = self
            .runtime
            .stop(name, self.config.rollback_stop_grace)
            .await
            && !e.is_not_found()
        {
            debug!(error = %e, "stop of failed container");
        }
        if let Err(e) = self.runtime.remove(name).await
            && !e.is_not_found()
        {
            warn!(error = %e, "failed container not removed");
        }

        self.runtime
            .rename(&backup, name)
            .await
            .map_err(|e| format!("rename {} -> {}: {}", backup, name, e))?;
        self.runtime
            .start(name)
            .await
            .map_err(|e| format!("start restored {}: {}", name, e))?;
        Ok(backup)
    }

    fn raise(&self, alert: ManualIntervention) -> UpdateError {
        error!(
            service = %alert.service,
            canonical = %alert.canonical_name,
            backup = alert.backup_name.as_deref().unwrap_or("<none>"),
            last_state = ?alert.last_state,
            old_image = %alert.old_image,
            new_image = %alert.new_image,
            reason = %alert.reason,
            "MANUAL INTERVENTION REQUIRED"
        );
        UpdateError::ManualIntervention(Box::new(alert))
    }
}
