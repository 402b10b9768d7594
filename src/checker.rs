// Update availability check for one service: compare the running image with the registry's latest
// and choose what to do about a difference. Pulls, never mutates a container.

use crate::error::UpdateError;
use crate::models::{ImageVersion, ServiceSpec, UpdateDecision, UpdatePolicy};
use crate::runtime::ContainerRuntime;
use crate::window::{UpdateWindow, in_window};
use chrono::NaiveTime;
use tracing::{debug, info};

/// Pure decision table behind `decide`.
pub fn classify(
    current: &ImageVersion,
    latest: &ImageVersion,
    policy: UpdatePolicy,
    auto_update_enabled: bool,
    in_window: bool,
) -> UpdateDecision {
    if current == latest {
        UpdateDecision::NoUpdate
    } else if policy == UpdatePolicy::Auto && auto_update_enabled {
        if in_window {
            UpdateDecision::ApplyNow
        } else {
            UpdateDecision::DeferToWindow
        }
    } else {
        UpdateDecision::ManualRequired
    }
}

/// Decide what to do for `service` at wall-clock `now` (in the window's zone).
/// The image returned alongside any decision other than `NoUpdate` is the update target.
pub async fn decide<R: ContainerRuntime>(
    service: &ServiceSpec,
    runtime: &R,
    auto_update_enabled: bool,
    window: &UpdateWindow,
    now: NaiveTime,
) -> Result<(UpdateDecision, Option<ImageVersion>), UpdateError> {
    let current = runtime
        .inspect(&service.name)
        .await
        .map_err(|e| {
            debug!(service = %service.name, error = %e, "inspect failed");
            if e.is_not_found() {
                UpdateError::ServiceNotFound {
                    service: service.name.clone(),
                }
            } else {
                UpdateError::Runtime {
                    service: service.name.clone(),
                    source: e,
                }
            }
        })?
        .image;

    info!(service = %service.name, image = %service.image, "pulling latest image");
    let latest = runtime
        .pull(&service.image)
        .await
        .map_err(|source| UpdateError::Pull {
            image: service.image.clone(),
            source,
        })?;

    let decision = classify(
        &current,
        &latest,
        service.update_policy,
        auto_update_enabled,
        in_window(now, window),
    );
    info!(
        service = %service.name,
        current = %current.short(),
        latest = %latest.short(),
        ?decision,
        "update check"
    );
    let target = (decision != UpdateDecision::NoUpdate).then_some(latest);
    Ok((decision, target))
}
