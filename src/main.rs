use procbridge::config::Config;
use procbridge::context::BridgeContext;
use procbridge::handler::RequestHandler;
use procbridge::server::BridgeServer;
use procbridge::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Config file read when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "procbridge.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    let dotenv_path = dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("procbridge=debug".parse().expect("valid log directive")),
        )
        .init();

    if let Some(path) = dotenv_path {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = load_config()?;

    print_startup_banner(&config);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Base environment is captured here, once, before any request is served
    let context = BridgeContext::init(&config);
    let handler = RequestHandler::new(context);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = BridgeServer::new(addr, handler, shutdown_rx)
        .with_max_body_bytes(config.server.max_body_bytes);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Bridge server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    // Workers of in-flight requests are terminated as their handling flows are dropped
    let _ = tokio::time::timeout(config.worker.shutdown_grace_period() + Duration::from_secs(1), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // An explicit path must exist; the default one is optional
    if explicit.is_none() && !Path::new(&config_path).exists() {
        let config = Config::from_env().map_err(|e| {
            error!(error = %e, "Invalid configuration");
            e
        })?;
        info!("No configuration file, using defaults and environment");
        return Ok(config);
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    let worker = &config.worker;
    info!(
        name = PKG_NAME,
        version = VERSION,
        bind = %config.server.bind,
        port = config.server.port,
        max_body_bytes = config.server.max_body_bytes,
        "Starting"
    );
    info!(
        candidates = ?worker.candidates(),
        args = ?worker.args,
        working_dir = %worker.working_dir().display(),
        mode = ?worker.mode,
        timeout_secs = worker.timeout_secs,
        "Worker configuration"
    );
}
