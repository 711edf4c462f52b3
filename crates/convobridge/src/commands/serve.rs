//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use convobridge::bridge::Bridge;
use convobridge::cache::Caches;
use convobridge::config::{Config, Timings};
use convobridge::console::HttpConsoleClient;
use convobridge::server::{self, AppState};
use convobridge::tenant::MemoryTenantStore;
use convobridge::transport::SidecarRegistry;

const CONSOLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("failed to load '{config_path}'"))?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let console = HttpConsoleClient::new(CONSOLE_REQUEST_TIMEOUT)
        .context("failed to build console client")?;
    let registry = SidecarRegistry::new(
        &config.transport.sidecar_url,
        Duration::from_secs(config.transport.request_timeout_seconds),
    )
    .context("failed to build transport client")?;
    let tenants = MemoryTenantStore::from_configs(&config.tenants);
    info!(tenants = config.tenants.len(), "Loaded tenants");

    let bridge = Bridge::new(
        Arc::new(console),
        Arc::new(registry),
        Arc::new(tenants),
        Caches::from_config(&config.cache),
        Timings::from(&config.reliability),
    );
    let maintenance =
        bridge.spawn_maintenance(Duration::from_secs(config.cache.sweep_interval_seconds));

    let state = AppState {
        bridge: bridge.clone(),
        api_token: config.server.api_token.clone(),
        max_connections: config.server.max_connections,
    };
    if state.api_token.is_none() {
        warn!("No api_token configured, the API only accepts loopback clients");
    }
    let app = server::build_app(state, config.server.request_timeout_seconds);

    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid server.host '{}'", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "Starting server");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop every monitor and wait for the tasks
    bridge.shutdown().await;

    for task in maintenance {
        task.abort();
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
