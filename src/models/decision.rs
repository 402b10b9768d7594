use serde::Serialize;

/// Outcome of comparing a service's running image with the registry's latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    NoUpdate,
    ApplyNow,
    DeferToWindow,
    ManualRequired,
}
