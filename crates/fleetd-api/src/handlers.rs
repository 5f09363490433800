//! Route handlers for the HTTP control surface (§6).
//!
//! Grounded on `sx9-port-manager::handlers` for the `State`/`Json<Value>`
//! idiom; status codes added per the spec's "4xx on argument errors, 5xx on
//! internal failure" rule, which that handler set does not itself enforce.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use fleetd_runtime::PortMapping;
use fleetd_types::{FleetError, RelationType};
use serde_json::{json, Value};

use crate::types::{
    CreateContainerBody, MetricsSummaryQuery, MlTrainBody, RelationBody, ScalingHistoryQuery,
    TrafficStartBody, TrafficStopBody,
};
use crate::AppState;

fn fleet_error_response(err: FleetError) -> (StatusCode, Json<Value>) {
    let status = match err {
        FleetError::AlreadyExists(_)
        | FleetError::IsReplica(_)
        | FleetError::ReplicaCapReached(_)
        | FleetError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "fleetd",
        "description": "container fleet autoscaling orchestrator",
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.orchestrator.graph_stats().await;
    let (containers_count, replicas_current) = state.orchestrator.resource_counts().await;
    Json(json!({
        "status": "healthy",
        "services": {
            "orchestrator": "up",
            "traffic_driver": "up",
        },
        "stats": {
            "containers_count": containers_count,
            "replicas_current": replicas_current,
            "total_relations": stats.total_relations,
            "is_connected": stats.is_connected,
        }
    }))
}

pub async fn create_container(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateContainerBody>,
) -> (StatusCode, Json<Value>) {
    let ports: Vec<PortMapping> = body
        .ports
        .into_iter()
        .map(|p| PortMapping {
            host_port: p.host_port,
            container_port: p.container_port,
        })
        .collect();

    match state
        .orchestrator
        .create(&body.image, &body.name, body.env, ports)
        .await
    {
        Ok(id) => (StatusCode::OK, Json(json!({ "status": "created", "id": id }))),
        Err(e) => fleet_error_response(e),
    }
}

pub async fn container_metrics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<Value> {
    let samples = state.orchestrator.container_metrics(&name, 10).await;
    Json(json!(samples))
}

pub async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.orchestrator.stop_container(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "stopped", "name": name })),
        ),
        Err(e) => fleet_error_response(e),
    }
}

pub async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.orchestrator.start_container(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "started", "name": name })),
        ),
        Err(e) => fleet_error_response(e),
    }
}

pub async fn remove_container(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.orchestrator.remove_container(&name).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({ "status": status, "name": name })),
        ),
        Err(e) => fleet_error_response(e),
    }
}

pub async fn list_containers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let containers = state.orchestrator.list_containers().await;
    Json(json!({ "containers": containers }))
}

pub async fn add_relation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RelationBody>,
) -> (StatusCode, Json<Value>) {
    let relation_type = RelationType::from(body.relation_type.as_deref().unwrap_or("depends_on"));
    state
        .orchestrator
        .add_relation(&body.from, &body.to, relation_type)
        .await;
    (StatusCode::OK, Json(json!({ "status": "relation added" })))
}

pub async fn remove_relation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RelationBody>,
) -> (StatusCode, Json<Value>) {
    let removed = state
        .orchestrator
        .remove_relation(&body.from, &body.to, body.relation_type.as_deref())
        .await;
    let status = if removed > 0 { "removed" } else { "not_found" };
    (
        StatusCode::OK,
        Json(json!({ "status": status, "removed": removed })),
    )
}

pub async fn graph_export(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "graph": state.orchestrator.graph_export().await }))
}

pub async fn graph_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.orchestrator.graph_stats().await))
}

pub async fn route(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let outcome = state.orchestrator.route(&name, payload).await;
    Json(json!(outcome))
}

pub async fn traffic_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TrafficStartBody>,
) -> (StatusCode, Json<Value>) {
    let job = state.traffic.start(
        body.target,
        body.rps,
        body.complexity,
        body.duration_seconds,
        body.direct,
    );
    (StatusCode::OK, Json(json!({ "status": "started", "job": job })))
}

pub async fn traffic_stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TrafficStopBody>,
) -> (StatusCode, Json<Value>) {
    match state.traffic.stop(&body.id) {
        Some(job) => (
            StatusCode::OK,
            Json(json!({ "status": "stopping", "job": job })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("traffic job '{}' not found", body.id) })),
        ),
    }
}

pub async fn traffic_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "jobs": state.traffic.list() }))
}

pub async fn metrics_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsSummaryQuery>,
) -> Json<Value> {
    let traffic = state.traffic.traffic_summary(query.traffic_id.as_deref());
    let resources = state.traffic.resource_summary().await;
    let scaling = state.orchestrator.scaling_history(None, 10).await;
    Json(json!({
        "traffic": traffic,
        "resources": resources,
        "scaling": scaling,
    }))
}

pub async fn scaling_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScalingHistoryQuery>,
) -> Json<Value> {
    let history = state
        .orchestrator
        .scaling_history(query.container.as_deref(), query.limit)
        .await;
    Json(json!({ "history": history }))
}

pub async fn ml_train(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MlTrainBody>,
) -> (StatusCode, Json<Value>) {
    match state
        .orchestrator
        .train_model(&body.container_name, body.days)
        .await
    {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({ "status": "trained", "samples": summary.samples_used })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.orchestrator.predict(&name).await {
        Some(result) => (StatusCode::OK, Json(json!(result))),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("not enough samples to predict for '{}'", name) })),
        ),
    }
}
