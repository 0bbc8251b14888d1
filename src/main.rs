use dockercloud::config::Config;
use dockercloud::gce::GceCloud;
use dockercloud::proxy::{ProxyServer, ProxySettings};
use dockercloud::transport::PoolConfig;
use dockercloud::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockercloud=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let cloud = GceCloud::new(&config.gce, config.instance.docker_port).map_err(|e| {
        error!(error = %e, "Failed to initialize cloud provider");
        anyhow::anyhow!(e)
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;

    let server = ProxyServer::with_pool_config(
        bind_addr,
        Arc::new(cloud),
        ProxySettings::from_config(&config),
        shutdown_rx,
        pool_config,
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting docker cloud proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tunnel_host = %config.server.tunnel_host,
        error_format = ?config.server.error_format,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        instance = %config.instance.name,
        zone = %config.instance.zone,
        docker_port = config.instance.docker_port,
        tunnel_port = config.instance.tunnel_port,
        "Managed instance"
    );
    info!(
        project = ?config.gce.project,
        machine_type = %config.gce.machine_type,
        disk = %config.gce.disk_name,
        disk_size_gb = config.gce.disk_size_gb,
        "Compute Engine settings"
    );
}
