// Registry reachability gate checked before each update cycle.

use anyhow::Context;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait RegistryProbe: Send + Sync {
    fn reachable(&self) -> impl Future<Output = bool> + Send;
}

/// GET `https://<registry>/v2/`: the registry API root answers 200, or 401 when auth is required.
pub struct HttpRegistryProbe {
    client: Client,
    url: String,
}

impl HttpRegistryProbe {
    pub fn new(registry: &str, node_id: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(format!(
                "{}/{} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                node_id
            ))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: registry_api_url(registry),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Registry API root for a host given with or without scheme.
pub fn registry_api_url(registry: &str) -> String {
    let host = registry.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/v2/", host)
    } else {
        format!("https://{}/v2/", host)
    }
}

pub fn status_means_reachable(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::UNAUTHORIZED
}

impl RegistryProbe for HttpRegistryProbe {
    async fn reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %self.url, %status, "registry probe");
                status_means_reachable(status)
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "registry probe failed");
                false
            }
        }
    }
}
