// Managed service definition (one entry of the `[[services]]` config array)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Canonical container name; unique across the config.
    pub name: String,
    /// Image reference pulled to look for updates (e.g. "registry.example.com/app:latest").
    pub image: String,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default = "default_rollback_enabled")]
    pub rollback_enabled: bool,
}

fn default_rollback_enabled() -> bool {
    true
}

impl ServiceSpec {
    pub fn is_auto(&self) -> bool {
        self.update_policy == UpdatePolicy::Auto
    }
}
