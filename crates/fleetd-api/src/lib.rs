//! HTTP control surface (§6): JSON in/out over the Orchestrator and Traffic
//! Driver, wired together as one axum `Router`.

mod handlers;
mod types;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use fleetd_orchestrator::Orchestrator;
use fleetd_traffic::TrafficDriver;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub traffic: Arc<TrafficDriver>,
}

pub fn router(orchestrator: Arc<Orchestrator>, traffic: Arc<TrafficDriver>) -> Router {
    let state = Arc::new(AppState {
        orchestrator,
        traffic,
    });

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/container/create", post(handlers::create_container))
        .route("/container/:name/metrics", get(handlers::container_metrics))
        .route("/container/:name/stop", post(handlers::stop_container))
        .route("/container/:name/start", post(handlers::start_container))
        .route("/container/:name/remove", delete(handlers::remove_container))
        .route("/containers/list", get(handlers::list_containers))
        .route("/relation/add", post(handlers::add_relation))
        .route("/relation/remove", post(handlers::remove_relation))
        .route("/graph/export", get(handlers::graph_export))
        .route("/graph/stats", get(handlers::graph_stats))
        .route("/route/:name", post(handlers::route))
        .route("/traffic/start", post(handlers::traffic_start))
        .route("/traffic/stop", post(handlers::traffic_stop))
        .route("/traffic/status", get(handlers::traffic_status))
        .route("/metrics/summary", get(handlers::metrics_summary))
        .route("/scaling/history", get(handlers::scaling_history))
        .route("/ml/train", post(handlers::ml_train))
        .route("/predict/:name", get(handlers::predict))
        .with_state(state)
}
