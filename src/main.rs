//! Accel-Engine Main Application
//!
//! HTTP server wrapping the engine: load/generate/stop/unload plus health
//! and status endpoints, with SSE streaming for progress and tokens.

use accel_engine::{
    api::{build_router, AppState},
    config::AccelConfig,
    engine::Engine,
    store::ObjectStore,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "accel_engine=debug,tower_http=debug,axum::rejection=trace",
                )
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Accel-Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = AccelConfig::load();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if config.server.host == "0.0.0.0" {
        warn!("⚠️  Server will accept connections from LAN (0.0.0.0)");
    } else {
        info!("🔒 Server bound to {} only", config.server.host);
    }

    info!("📦 Bundle store: {}", config.engine.data_dir);
    let store = match ObjectStore::open(&config.engine.data_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open object store: {}", e);
            std::process::exit(1);
        }
    };

    let engine = Engine::new(store, &config.engine);
    info!("✅ Engine initialized (state: {:?})", engine.state());

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        engine: engine.clone(),
        shutdown_flag: shutdown_flag.clone(),
        start_time: std::time::Instant::now(),
    };

    let mut app = build_router(app_state);

    if config.server.enable_cors {
        warn!("⚠️  CORS enabled - allowing cross-origin requests");
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app = app.layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let socket_addr: SocketAddr = addr.parse().unwrap_or_else(|e| {
        error!("Invalid socket address '{}': {}", addr, e);
        std::process::exit(1);
    });

    let listener = match tokio::net::TcpListener::bind(&socket_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", socket_addr, e);
            std::process::exit(1);
        }
    };

    info!("✅ Server listening on http://{}", socket_addr);
    info!("");
    info!("API endpoints:");
    info!("  POST http://{}/v1/models/load - Load a model (SSE progress)", socket_addr);
    info!("  POST http://{}/v1/generate - Generate text (SSE streaming)", socket_addr);
    info!("  POST http://{}/v1/stop - Stop the current generation", socket_addr);
    info!("  POST http://{}/v1/models/unload - Unload the model", socket_addr);
    info!("  GET  http://{}/v1/health - Health check", socket_addr);
    info!("  GET  http://{}/v1/status - Server status", socket_addr);

    let shutdown_future = shutdown_signal(shutdown_flag, engine);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_future)
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

/// Wait for a shutdown signal, stop any generation, and unload the model
async fn shutdown_signal(shutdown_flag: Arc<AtomicBool>, engine: Engine) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    shutdown_flag.store(true, Ordering::SeqCst);
    info!("Initiating graceful shutdown...");

    // Stop the decode loop at its next token boundary, then drop the session
    engine.stop();
    if let Err(e) = engine.unload().await {
        warn!("Unload during shutdown failed: {}", e);
    }
}
