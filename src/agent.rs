// Check cycle over all configured services, deferred-apply drain, and the periodic driver.
// Services are handled strictly one after another; shutdown is honored between services,
// never inside an apply.

use crate::alert::write_alert;
use crate::checker::decide;
use crate::config::AppConfig;
use crate::deferred::{DeferredApply, DeferredQueue};
use crate::error::UpdateError;
use crate::connectivity::RegistryProbe;
use crate::executor::{ApplyOutcome, UpdateExecutor};
use crate::health::HealthCheck;
use crate::models::{ImageVersion, ServiceSpec, UpdateDecision};
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};
use tracing::{Instrument, debug, error, info, warn};

/// Bookkeeping carried between cycles by the driver.
#[derive(Debug, Default)]
pub struct AgentState {
    pub last_check: Option<DateTime<Utc>>,
    /// Services whose rollback failed; skipped until an operator restarts the agent.
    pub quarantined: BTreeSet<String>,
    pub deferred: DeferredQueue,
}

#[derive(Debug)]
pub enum ServiceResult {
    NoUpdate,
    ManualRequired {
        target: ImageVersion,
    },
    Deferred {
        target: ImageVersion,
        due: DateTime<Utc>,
    },
    Applied(ApplyOutcome),
    Failed(UpdateError),
}

#[derive(Debug)]
pub struct ServiceReport {
    pub service: String,
    pub result: ServiceResult,
}

#[derive(Debug)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// Set when the whole cycle was skipped (registry unreachable).
    pub skipped: Option<UpdateError>,
    /// Shutdown arrived before every service was checked.
    pub interrupted: bool,
    pub services: Vec<ServiceReport>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            skipped: None,
            interrupted: false,
            services: Vec::new(),
        }
    }

    pub fn result(&self, service: &str) -> Option<&ServiceResult> {
        self.services
            .iter()
            .find(|r| r.service == service)
            .map(|r| &r.result)
    }

    pub fn fatal_count(&self) -> usize {
        self.services
            .iter()
            .filter(|r| matches!(&r.result, ServiceResult::Failed(e) if e.is_fatal()))
            .count()
    }

    fn log_summary(&self) {
        if self.skipped.is_some() {
            return;
        }
        let mut applied = 0;
        let mut rolled_back = 0;
        let mut deferred = 0;
        let mut failed = 0;
        for r in &self.services {
            match &r.result {
                ServiceResult::Applied(ApplyOutcome::Applied(_)) => applied += 1,
                ServiceResult::Applied(ApplyOutcome::RolledBack { .. }) => rolled_back += 1,
                ServiceResult::Deferred { .. } => deferred += 1,
                ServiceResult::Failed(_) => failed += 1,
                _ => {}
            }
        }
        info!(
            services = self.services.len(),
            applied,
            rolled_back,
            deferred,
            failed,
            fatal = self.fatal_count(),
            interrupted = self.interrupted,
            "update cycle finished"
        );
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

fn log_result(service: &str, result: &ServiceResult) {
    match result {
        ServiceResult::NoUpdate => info!(service, "no update available"),
        ServiceResult::ManualRequired { target } => {
            info!(service, target = %target.short(), "manual update required")
        }
        ServiceResult::Deferred { target, due } => {
            info!(service, target = %target.short(), %due, "update deferred to maintenance window")
        }
        ServiceResult::Applied(ApplyOutcome::Applied(u)) => info!(
            service,
            old_image = %u.old_image.short(),
            new_image = %u.new_image.short(),
            "updated"
        ),
        ServiceResult::Applied(ApplyOutcome::UpToDate) => info!(service, "already up to date"),
        ServiceResult::Applied(ApplyOutcome::AbortedNoChange(e)) => {
            warn!(service, kind = e.kind(), error = %e, "update aborted; service unchanged")
        }
        ServiceResult::Applied(ApplyOutcome::RolledBack { cause, backup_name }) => warn!(
            service,
            kind = cause.kind(),
            error = %cause,
            backup = %backup_name,
            "update rolled back"
        ),
        ServiceResult::Failed(e @ UpdateError::Quarantined { .. }) => {
            warn!(service, kind = e.kind(), "skipped: awaiting manual intervention")
        }
        ServiceResult::Failed(e) if e.is_fatal() => {
            error!(service, kind = e.kind(), error = %e, "update failed; manual intervention required")
        }
        ServiceResult::Failed(e) => {
            warn!(service, kind = e.kind(), error = %e, "update check failed")
        }
    }
}

/// Check every configured service once. `can_reach_registry` gates the whole cycle.
pub async fn run_cycle<R: ContainerRuntime, H: HealthCheck>(
    config: &AppConfig,
    executor: &UpdateExecutor<R, H>,
    state: &mut AgentState,
    can_reach_registry: bool,
    now: DateTime<Utc>,
    shutdown: &watch::Receiver<bool>,
) -> CycleReport {
    let mut report = CycleReport::new(now);
    if !can_reach_registry {
        info!(registry = %config.registry_url, "no registry connectivity - skipping update check");
        report.skipped = Some(UpdateError::ConnectivityUnavailable {
            registry: config.registry_url.clone(),
        });
        return report;
    }

    info!(services = config.services.len(), "checking for container updates");
    state.last_check = Some(now);
    let started = Instant::now();
    for service in &config.services {
        if stopping(shutdown) {
            info!("shutdown requested; remaining services skipped");
            report.interrupted = true;
            break;
        }
        let at = now + chrono::Duration::from_std(started.elapsed()).unwrap_or_default();
        let result = check_service(config, executor, state, service, at)
            .instrument(tracing::info_span!("service", name = %service.name))
            .await;
        log_result(&service.name, &result);
        report.services.push(ServiceReport {
            service: service.name.clone(),
            result,
        });
    }
    report
}

async fn check_service<R: ContainerRuntime, H: HealthCheck>(
    config: &AppConfig,
    executor: &UpdateExecutor<R, H>,
    state: &mut AgentState,
    service: &ServiceSpec,
    now: DateTime<Utc>,
) -> ServiceResult {
    if state.quarantined.contains(&service.name) {
        return quarantined(&service.name);
    }
    let window = &config.update_window;
    let wall_clock = window.time_of_day(now);

    let mut attempt = 1;
    let checked = loop {
        match decide(
            service,
            executor.runtime(),
            config.auto_update_enabled,
            window,
            wall_clock,
        )
        .await
        {
            Ok(checked) => break checked,
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                warn!(attempt, max_retries = config.max_retries, error = %e, "check failed; retrying");
                attempt += 1;
                sleep(Duration::from_secs(config.retry_delay_secs)).await;
            }
            Err(e) => return ServiceResult::Failed(e),
        }
    };

    match checked {
        (UpdateDecision::NoUpdate, _) | (_, None) => {
            if state.deferred.cancel(&service.name).is_some() {
                debug!("pending deferred apply dropped; service already current");
            }
            ServiceResult::NoUpdate
        }
        (UpdateDecision::ManualRequired, Some(target)) => {
            state.deferred.cancel(&service.name);
            ServiceResult::ManualRequired { target }
        }
        (UpdateDecision::DeferToWindow, Some(target)) => {
            let due = window.next_start_after(now);
            let replaced = state.deferred.schedule(DeferredApply {
                due,
                service: service.name.clone(),
                target: target.clone(),
            });
            if let Some(old) = replaced
                && old.target != target
            {
                debug!(previous = %old.target.short(), "deferred target superseded");
            }
            ServiceResult::Deferred { target, due }
        }
        (UpdateDecision::ApplyNow, Some(target)) => {
            state.deferred.cancel(&service.name);
            let result = executor.apply(service, &target).await;
            settle(config, state, &service.name, result, now)
        }
    }
}

fn quarantined(service: &str) -> ServiceResult {
    ServiceResult::Failed(UpdateError::Quarantined {
        service: service.to_string(),
    })
}

/// Record the result of an apply; fatal outcomes quarantine the service and raise an alert.
fn settle(
    config: &AppConfig,
    state: &mut AgentState,
    service: &str,
    result: Result<ApplyOutcome, UpdateError>,
    now: DateTime<Utc>,
) -> ServiceResult {
    match result {
        Ok(outcome) => ServiceResult::Applied(outcome),
        Err(e) => {
            if let UpdateError::ManualIntervention(alert) = &e {
                state.quarantined.insert(service.to_string());
                if let Some(dir) = &config.alert_dir {
                    match write_alert(Path::new(dir), &config.node_id, alert, now) {
                        Ok(path) => error!(service, path = %path.display(), "alert written"),
                        Err(err) => error!(service, error = %err, "could not write alert file"),
                    }
                }
            }
            ServiceResult::Failed(e)
        }
    }
}

/// Run every deferred apply that is due at `now`.
pub async fn drain_deferred<R: ContainerRuntime, H: HealthCheck>(
    config: &AppConfig,
    executor: &UpdateExecutor<R, H>,
    state: &mut AgentState,
    now: DateTime<Utc>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<ServiceReport> {
    let mut reports = Vec::new();
    let mut due = state.deferred.drain_due(now).into_iter();
    while let Some(entry) = due.next() {
        if stopping(shutdown) {
            state.deferred.schedule(entry);
            for rest in due.by_ref() {
                state.deferred.schedule(rest);
            }
            break;
        }
        let service = entry.service.clone();
        let Some(result) = run_deferred(config, executor, state, entry, now)
            .instrument(tracing::info_span!("deferred", name = %service))
            .await
        else {
            continue;
        };
        log_result(&service, &result);
        reports.push(ServiceReport { service, result });
    }
    reports
}

async fn run_deferred<R: ContainerRuntime, H: HealthCheck>(
    config: &AppConfig,
    executor: &UpdateExecutor<R, H>,
    state: &mut AgentState,
    entry: DeferredApply,
    now: DateTime<Utc>,
) -> Option<ServiceResult> {
    let Some(service) = config.service(&entry.service) else {
        debug!("service no longer configured; deferred apply dropped");
        return None;
    };
    if state.quarantined.contains(&service.name) {
        return Some(quarantined(&service.name));
    }
    if !(service.is_auto() && config.auto_update_enabled) {
        return Some(ServiceResult::ManualRequired {
            target: entry.target,
        });
    }
    let window = &config.update_window;
    if !window.contains(now) {
        // Picked up after the window closed; wait for the next one.
        let due = window.next_start_after(now);
        state.deferred.schedule(DeferredApply { due, ..entry.clone() });
        return Some(ServiceResult::Deferred {
            target: entry.target,
            due,
        });
    }
    info!(target_image = %entry.target.short(), "applying deferred update");
    let result = executor.apply(service, &entry.target).await;
    Some(settle(config, state, &service.name, result, now))
}

/// Executor, probe and shutdown for the driver.
pub struct AgentDeps<R, H, P> {
    pub executor: Arc<UpdateExecutor<R, H>>,
    pub probe: P,
    pub shutdown_rx: watch::Receiver<bool>,
    /// Re-read before every check cycle when set; the last good config is kept on error.
    pub config_path: Option<String>,
}

/// Spawns the driver: an immediate check, then one every `check_interval_secs`, plus a deferred
/// drain every `executor.deferred_poll_secs`. Returns the final state on shutdown.
pub fn spawn<R, H, P>(deps: AgentDeps<R, H, P>, config: AppConfig) -> tokio::task::JoinHandle<AgentState>
where
    R: ContainerRuntime + 'static,
    H: HealthCheck + 'static,
    P: RegistryProbe + 'static,
{
    tokio::spawn(async move { run(deps, config).await })
}

async fn run<R, H, P>(deps: AgentDeps<R, H, P>, mut config: AppConfig) -> AgentState
where
    R: ContainerRuntime,
    H: HealthCheck,
    P: RegistryProbe,
{
    let AgentDeps {
        executor,
        probe,
        mut shutdown_rx,
        config_path,
    } = deps;
    let cycle_shutdown = shutdown_rx.clone();
    let mut state = AgentState::default();

    let mut check_tick = interval(Duration::from_secs(config.check_interval_secs));
    check_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deferred_tick = interval(Duration::from_secs(config.executor.deferred_poll_secs));
    deferred_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        node_id = %config.node_id,
        services = config.services.len(),
        check_interval_secs = config.check_interval_secs,
        "update agent started"
    );

    loop {
        tokio::select! {
            _ = check_tick.tick() => {
                if let Some(path) = &config_path {
                    match AppConfig::load_from_path(path) {
                        Ok(fresh) => config = fresh,
                        Err(e) => warn!(error = %e, path = %path, "config reload failed; keeping previous"),
                    }
                }
                let reachable = probe.reachable().await;
                let report = run_cycle(&config, &executor, &mut state, reachable, Utc::now(), &cycle_shutdown)
                    .instrument(tracing::info_span!("cycle", node_id = %config.node_id))
                    .await;
                report.log_summary();
            }
            _ = deferred_tick.tick() => {
                if state.deferred.is_empty() {
                    continue;
                }
                let reports = drain_deferred(&config, &executor, &mut state, Utc::now(), &cycle_shutdown).await;
                debug!(applied = reports.len(), pending = state.deferred.len(), "deferred queue drained");
            }
            _ = shutdown_rx.changed() => {
                debug!("agent shutting down");
                break;
            }
        }
    }
    state
}
