use serde::{Deserialize, Serialize};
use std::fmt;

/// Content identifier of an image (e.g. "sha256:3f1c..."). Compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageVersion(String);

impl ImageVersion {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters of the digest, as `docker ps` shows it.
    pub fn short(&self) -> &str {
        let hex = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
        hex.char_indices().nth(12).map_or(hex, |(i, _)| &hex[..i])
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImageVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}
