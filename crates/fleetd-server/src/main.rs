//! Process entry point (§6): wires the container runtime, persistence,
//! Orchestrator, Traffic Driver, and HTTP surface together, then drives the
//! background loops until a shutdown signal arrives.
//!
//! Grounded on `sx9-gateway-primary/src/server.rs`'s
//! `tracing_subscriber::fmt().with_env_filter(...)` + `axum::serve` idiom.

use std::net::SocketAddr;
use std::sync::Arc;

use fleetd_orchestrator::{Config, Orchestrator};
use fleetd_runtime::{DockerRuntime, RuntimeAdapter};
use fleetd_storage::SledStorage;
use fleetd_traffic::TrafficDriver;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_STORAGE_PATH: &str = "./fleetd-data";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting fleetd orchestrator");

    // Fatal at boot only (§7): both the runtime and persistence must be
    // reachable before we accept any traffic.
    let runtime = match DockerRuntime::connect() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to connect to the container runtime");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.ping().await {
        error!(error = %e, "container runtime did not respond to ping");
        std::process::exit(1);
    }

    let storage_path =
        std::env::var("FLEETD_STORAGE_PATH").unwrap_or_else(|_| DEFAULT_STORAGE_PATH.to_string());
    let storage = match SledStorage::open(&storage_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, path = %storage_path, "failed to initialize persistence");
            std::process::exit(1);
        }
    };

    let config = Config::from_env(runtime.as_ref()).await;
    info!(network = %config.network_name, "resolved orchestrator network");

    let orchestrator = Arc::new(Orchestrator::new(runtime, storage, config).await);
    let traffic = Arc::new(TrafficDriver::new(orchestrator.clone()));

    let cancel = CancellationToken::new();

    let monitor_orchestrator = orchestrator.clone();
    let monitor_cancel = cancel.clone();
    tokio::spawn(async move {
        monitor_orchestrator.monitor_loop(monitor_cancel).await;
    });

    let gc_orchestrator = orchestrator.clone();
    let gc_cancel = cancel.clone();
    tokio::spawn(async move {
        gc_orchestrator.idle_replica_gc_loop(gc_cancel).await;
    });

    let app = fleetd_api::router(orchestrator, traffic).layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "fleetd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("shutdown signal received, stopping background loops");
    cancel.cancel();
}
