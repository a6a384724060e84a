use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber;

use floodgate::config::EngineConfig;
use floodgate::middleware::RateLimitLayer;
use floodgate::ratelimit::{RateLimitEngine, Sweeper};

#[derive(Parser, Debug)]
#[command(name = "floodgate", about = "Adaptive rate limiting gateway")]
struct Args {
    /// Path to the engine configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting Floodgate Rate Limiting Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    info!(api_prefix = %config.api_prefix, "Configuration loaded");

    // Initialize the engine and its housekeeping timer
    let engine = Arc::new(RateLimitEngine::new(config).await?);
    let sweeper = Sweeper::start(engine.local_store(), engine.sweep_config().clone());
    info!("Rate limit engine initialized");

    // Every request passes the limiter before reaching the stub upstream,
    // which stands in for the application router.
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(upstream_stub)
        .layer(RateLimitLayer::new(engine));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("Listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown();
    info!("Floodgate Rate Limiting Gateway stopped");
    Ok(())
}

async fn upstream_stub(uri: axum::http::Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "path": uri.path(),
    }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
