//! Fieldsync Server
//!
//! Entry point: loads configuration, opens the database and serves the
//! sync API until shutdown.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldsync_server::config::Config;
use fieldsync_server::state::AppState;
use fieldsync_server::{app, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fieldsync_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Fieldsync Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db_pool = db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let app_state = AppState::new(config.clone(), db_pool);

    let sweeper = if config.sync.sweep_enabled {
        let handle = app_state
            .engine()
            .sweeper(
                app_state.publisher().clone(),
                chrono::Duration::seconds(config.sync.sweep_grace_secs),
                std::time::Duration::from_secs(config.sync.sweep_interval_secs),
            )
            .start();
        tracing::info!(
            interval_secs = config.sync.sweep_interval_secs,
            grace_secs = config.sync.sweep_grace_secs,
            "Pending batch sweeper started"
        );
        Some(handle)
    } else {
        None
    };

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST: {}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Fieldsync Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
