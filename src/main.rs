mod api;
mod auth;
mod config;
mod connector;
mod error;
#[cfg(unix)]
mod local;
mod process;
mod utils;

use crate::config::Config;
use crate::connector::Connector;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("procwarden={},tower_http=info", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let initial_config = Config::load().context("Failed to load initial configuration")?;
    setup_logging(&initial_config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting procwarden");
    tracing::debug!("Loaded initial configuration: {:?}", initial_config);

    let connector = Connector::new(initial_config)
        .await
        .context("Failed to initialize connector")?;
    let file_config = connector.file_config();
    let _users_poller = connector.spawn_background_tasks();
    let started = connector.start_enabled();
    tracing::info!(started, "Started enabled servers");

    #[cfg(unix)]
    let local_socket = if file_config.unix_socket.enabled {
        let path = file_config.unix_socket.location.clone();
        let listener = local::bind(&path)?;
        tracing::info!(path = %path.display(), "Listening on local socket");
        Some((path, tokio::spawn(local::serve(connector.clone(), listener))))
    } else {
        None
    };

    let addr = format!("{}:{}", file_config.host, file_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, "Listening for HTTP connections");

    let app = api::build_router(connector.clone());
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    #[cfg(unix)]
    if let Some((path, task)) = local_socket {
        task.abort();
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove local socket");
        }
    }
    connector.shutdown().await;

    served.context("HTTP server failed")?;
    tracing::info!("Server shutdown.");
    Ok(())
}
