//! Tusk Server
//!
//! Standalone tus upload server with a background expiration sweep.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderName, Method};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tusk::config::Config;
use tusk::protocol::EXPOSED_HEADERS;
use tusk::store::{self, SERVER_PREFIX};
use tusk::TusServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tusk=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting Tusk Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Upload directory: {}", config.server.upload_dir.display());

    tokio::fs::create_dir_all(&config.server.upload_dir)
        .await
        .context("failed to create upload directory")?;

    let prefix = config.store.prefix.as_deref().unwrap_or(SERVER_PREFIX);
    let store = store::open(&config.store, prefix)
        .await
        .context("failed to open metadata store")?;

    let server = TusServer::new(config.server.clone(), store);

    if config.server.expiration_interval_secs > 0 {
        server.start_expiration_task(Duration::from_secs(config.server.expiration_interval_secs));
        tracing::info!(
            interval_secs = config.server.expiration_interval_secs,
            "Expiration sweep scheduled"
        );
    }

    // Browsers need the tus headers exposed to read offsets back
    let exposed: Vec<HeaderName> = EXPOSED_HEADERS
        .into_iter()
        .map(HeaderName::from_static)
        .chain([axum::http::header::LOCATION])
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::OPTIONS,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::GET,
            Method::DELETE,
        ])
        .allow_headers(Any)
        .expose_headers(exposed);

    let app = server
        .router()
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    tracing::info!("Tusk Server listening on {}{}", addr, config.server.api_path);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

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
