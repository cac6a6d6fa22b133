//! Machine management service
//!
//! Serves verified bootstrap images over HTTP.

use anyhow::{Context, Result};
use infra_machinemgmt::{api, build_state, config};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MACHINEMGMT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting machinemgmt");
    info!(
        listen_addr = %config.listen_addr,
        image_root = %config.image_root.display(),
        namespace = %config.image.namespace,
        "Configuration loaded"
    );

    // Cancelled on shutdown; every request holds a child of it.
    let shutdown = CancellationToken::new();

    let state = build_state(&config, shutdown.clone())
        .context("Failed to create bootstrap image service")?;
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    let server_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            log_server_exit(result);
            true
        }
    };

    shutdown.cancel();

    if !server_exited {
        match tokio::time::timeout(config.shutdown_timeout, server_handle).await {
            Ok(result) => log_server_exit(result),
            Err(_) => warn!(
                timeout_secs = config.shutdown_timeout.as_secs(),
                "Server did not shut down in time"
            ),
        }
    }

    info!("machinemgmt shutdown complete");
    Ok(())
}

fn log_server_exit(result: Result<std::io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("Server exited normally"),
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task panicked"),
    }
}
