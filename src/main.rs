use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use update_agent::*;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let config_path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
    let app_config = config::AppConfig::load_or_init(&config_path)?;

    let runtime = Arc::new(runtime::DockerRuntime::connect()?);
    match runtime.ping().await {
        Ok(api_version) => tracing::info!(api_version = %api_version, "connected to Docker"),
        Err(e) => tracing::warn!(error = %e, "Docker not reachable yet; checks will fail until it is"),
    }

    let executor = Arc::new(executor::UpdateExecutor::new(
        runtime,
        app_config.liveness_monitor(),
        app_config.executor_config(),
    ));
    let probe = connectivity::HttpRegistryProbe::new(&app_config.registry_url, &app_config.node_id)?;
    tracing::info!(node_id = %app_config.node_id, probe = %probe.url(), "starting update agent");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agent_handle = agent::spawn(
        agent::AgentDeps {
            executor,
            probe,
            shutdown_rx,
            config_path: Some(config_path),
        },
        app_config,
    );

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    // An apply in progress runs to completion before the agent stops.
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    let state = agent_handle.await?;
    if !state.quarantined.is_empty() {
        tracing::error!(
            services = ?state.quarantined,
            "services awaiting manual intervention"
        );
    }
    Ok(())
}
