// Post-update health check.
// The default monitor is a shallow liveness signal: the container process is running and stays
// up through a short stabilization period. Richer checks implement `HealthCheck`.

use crate::runtime::ContainerRuntime;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STABILIZATION: Duration = Duration::from_secs(10);

pub trait HealthCheck: Send + Sync {
    /// Resolves true once `name` is considered healthy, false when `timeout` elapses first.
    fn wait_healthy<R: ContainerRuntime>(
        &self,
        runtime: &R,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = bool> + Send;
}

/// Polls container status until it reports running, then waits out a stabilization grace.
/// The grace never extends past the caller's timeout.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    pub poll_interval: Duration,
    pub stabilization: Duration,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stabilization: DEFAULT_STABILIZATION,
        }
    }
}

impl LivenessMonitor {
    pub fn new(poll_interval: Duration, stabilization: Duration) -> Self {
        Self {
            poll_interval,
            stabilization,
        }
    }

    async fn is_running<R: ContainerRuntime>(runtime: &R, name: &str) -> bool {
        match runtime.inspect(name).await {
            Ok(details) => {
                debug!(container = name, state = ?details.state, "health poll");
                details.state.is_running()
            }
            Err(e) => {
                debug!(container = name, error = %e, "health poll failed");
                false
            }
        }
    }
}

impl HealthCheck for LivenessMonitor {
    async fn wait_healthy<R: ContainerRuntime>(
        &self,
        runtime: &R,
        name: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if Self::is_running(runtime, name).await {
                sleep(
                    self.stabilization
                        .min(deadline.saturating_duration_since(Instant::now())),
                )
                .await;
                // A container that crashed during the grace period is not healthy yet.
                if Self::is_running(runtime, name).await {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
