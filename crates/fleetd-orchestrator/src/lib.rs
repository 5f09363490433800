//! Fleet state, background loops, and the scaling/routing engine.
//!
//! Grounded on `original_source/main_container/orchestrator.py` for every
//! operation's semantics, and on `sx9-cdn-monitoring`'s
//! `Arc<Mutex<HashMap<...>>>` state-holding idiom (here `tokio::sync::RwLock`
//! per map, §5 option (b)) for how the state is actually held.

mod config;
mod types;

pub use config::{resolve_network_name, Config};
pub use fleetd_runtime::PortMapping;
pub use types::{ContainerSummary, Instance, RouteOutcome};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleetd_graph::{Graph, GraphStats};
use fleetd_metrics::MetricsCollector;
use fleetd_predictor::{PredictionResult, PredictorError, TrainingPoint, TrainingSummary};
use fleetd_runtime::RuntimeAdapter;
use fleetd_storage::{ContainerRecord, PersistenceAdapter};
use fleetd_types::{
    is_replica, parse_replica_name, replica_name, ContainerStatus, FleetError, Relation,
    RelationType, Sample, ScalingEvent, ScalingEventKind, INFRA_NAMES,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const METRICS_RING_CAPACITY: usize = 100;
const MIN_SAMPLES_FOR_DECISION: usize = 10;
const PREDICTION_WINDOW: usize = 20;
const PREDICTION_HORIZON: usize = 5;
const LOW_HEALTH_WATERMARK: f64 = 30.0;
const IDLE_GC_INTERVAL: Duration = Duration::from_secs(10);

fn is_worker_image(image: &str) -> bool {
    image.contains("worker") && !image.contains("nginx") && !image.contains("mongo")
}

/// Owns the authoritative fleet state (§4.4), drives the monitor and
/// idle-replica GC background loops, and serves as the routing engine the
/// HTTP layer and traffic driver both call into.
pub struct Orchestrator {
    runtime: Arc<dyn RuntimeAdapter>,
    storage: Arc<dyn PersistenceAdapter>,
    graph: RwLock<Graph>,
    fleet: RwLock<HashMap<String, Instance>>,
    metrics: RwLock<HashMap<String, VecDeque<Sample>>>,
    scaling_cooldown: RwLock<HashMap<String, Instant>>,
    last_request_at: RwLock<HashMap<String, Instant>>,
    metrics_collector: Mutex<MetricsCollector>,
    http: reqwest::Client,
    pub config: Config,
}

impl Orchestrator {
    /// Hydrates the graph from persisted containers/relations before the
    /// first `reconcile()` call; fleet state itself always comes from the
    /// live runtime, never from storage.
    pub async fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        storage: Arc<dyn PersistenceAdapter>,
        config: Config,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let orchestrator = Self {
            runtime,
            storage,
            graph: RwLock::new(Graph::new()),
            fleet: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            scaling_cooldown: RwLock::new(HashMap::new()),
            last_request_at: RwLock::new(HashMap::new()),
            metrics_collector: Mutex::new(MetricsCollector::new()),
            http,
            config,
        };
        orchestrator.hydrate_graph_from_storage().await;
        orchestrator
    }

    async fn hydrate_graph_from_storage(&self) {
        let containers = self.storage.list_containers().await;
        let relations = self.storage.find_all_relations().await;
        let mut graph = self.graph.write().await;
        for record in &containers {
            graph.add_node(&record.name, None);
        }
        for relation in &relations {
            graph.add_edge(
                &relation.from,
                &relation.to,
                relation.relation_type.clone(),
                relation.weight,
            );
        }
        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "hydrated graph from persistence"
        );
    }

    /// Rejects names already tracked. Worker images get `CONTAINER_NAME` and
    /// `ORCHESTRATOR_URL` env defaults plus a `master_of` edge from
    /// `orchestrator_main` (§4.4.1).
    pub async fn create(
        &self,
        image: &str,
        name: &str,
        env: Vec<String>,
        ports: Vec<PortMapping>,
    ) -> Result<String, FleetError> {
        if self.fleet.read().await.contains_key(name) {
            return Err(FleetError::AlreadyExists(name.to_string()));
        }

        let mut env = env;
        let worker = is_worker_image(image);
        if worker {
            if !env.iter().any(|e| e.starts_with("CONTAINER_NAME=")) {
                env.push(format!("CONTAINER_NAME={name}"));
            }
            if !env.iter().any(|e| e.starts_with("ORCHESTRATOR_URL=")) {
                env.push("ORCHESTRATOR_URL=http://main:5000".to_string());
            }
        }

        let id = self
            .runtime
            .run(image, name, &env, &self.config.network_name, &ports)
            .await
            .map_err(|e| FleetError::Runtime(e.to_string()))?;

        let parent = parse_replica_name(name).map(|(p, _)| p.to_string());

        if worker && parent.is_none() {
            self.graph
                .write()
                .await
                .add_edge("orchestrator_main", name, RelationType::master_of(), 1);
            self.storage
                .upsert_relation(&Relation {
                    from: "orchestrator_main".into(),
                    to: name.into(),
                    relation_type: RelationType::master_of(),
                    weight: 1,
                })
                .await;
        }

        self.fleet.write().await.insert(
            name.to_string(),
            Instance::new(id.clone(), image.to_string(), env.clone(), parent.clone()),
        );
        self.last_request_at
            .write()
            .await
            .insert(name.to_string(), Instant::now());

        self.storage
            .insert_container_info(&ContainerRecord {
                name: name.to_string(),
                image: image.to_string(),
                status: ContainerStatus::Running,
                parent,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;

        info!(container = name, image, "container created");
        Ok(id)
    }

    /// Reconciles tracked state against the live runtime (§4.4.1). Best
    /// effort: a failure inspecting one container never aborts the pass.
    pub async fn reconcile(&self) {
        let running = match self.runtime.list_running().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list running containers during reconcile");
                return;
            }
        };

        let mut live = Vec::new();
        for name in running {
            match self.runtime.get_network(&name).await {
                Ok(networks) if networks.iter().any(|n| n == &self.config.network_name) => {
                    live.push(name);
                }
                Ok(_) => {}
                Err(e) => warn!(container = %name, error = %e, "failed to inspect networks during reconcile"),
            }
        }

        // Resolve image/env for newly discovered containers before taking any
        // locks: background loops must never hold a shared lock across an
        // I/O call (§5 "Suspension points").
        let existing: HashSet<String> = self.fleet.read().await.keys().cloned().collect();
        let mut discovered: HashMap<String, (String, Vec<String>)> = HashMap::new();
        for name in &live {
            if INFRA_NAMES.contains(&name.as_str()) || existing.contains(name) {
                continue;
            }
            match self.runtime.inspect(name).await {
                Ok(info) => {
                    discovered.insert(name.clone(), (info.image, info.env));
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "failed to inspect container during reconcile");
                    discovered.insert(name.clone(), (String::new(), Vec::new()));
                }
            }
        }

        let mut graph = self.graph.write().await;
        let mut fleet = self.fleet.write().await;

        for name in &live {
            graph.add_node(name, None);
            if INFRA_NAMES.contains(&name.as_str()) {
                continue;
            }

            let parent = parse_replica_name(name).map(|(p, _)| p.to_string());
            if let Some((image, env)) = discovered.get(name) {
                if is_worker_image(image) && parent.is_none() {
                    graph.add_edge("orchestrator_main", name, RelationType::master_of(), 1);
                }
                fleet
                    .entry(name.clone())
                    .or_insert_with(|| Instance::new(String::new(), image.clone(), env.clone(), parent.clone()));
            }

            if let Some(parent_name) = &parent {
                graph.add_edge(parent_name, name, RelationType::replica_of(), 1);
                graph.remove_edge("orchestrator_main", name);
                if let Some(parent_instance) = fleet.get_mut(parent_name) {
                    if !parent_instance.replicas.contains(name) {
                        parent_instance.replicas.push(name.clone());
                    }
                }
            }
        }

        let live_set: HashSet<&String> = live.iter().collect();
        let stale: Vec<String> = fleet.keys().filter(|n| !live_set.contains(n)).cloned().collect();
        for name in &stale {
            fleet.remove(name);
            graph.remove_node(name);
        }
        drop(fleet);
        drop(graph);

        for name in &stale {
            self.storage.update_container_status(name, ContainerStatus::Removed).await;
        }
    }

    /// `reconcile()` then one stats observation per tracked container, every
    /// `monitor_interval`, until `cancel` fires (§4.4.1, §5).
    pub async fn monitor_loop(&self, cancel: CancellationToken) {
        loop {
            self.reconcile().await;
            let names: Vec<String> = self.fleet.read().await.keys().cloned().collect();
            for name in &names {
                self.observe_one(name).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
            }
        }
    }

    async fn observe_one(&self, name: &str) {
        let stats = match self.runtime.stats_snapshot(name).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(container = name, error = %e, "failed to read stats snapshot");
                None
            }
        };

        let now = Utc::now();
        let sample = {
            let mut collector = self.metrics_collector.lock().await;
            let sample = MetricsCollector::parse_stats_or_default(stats.as_ref(), now);
            let (rx_throughput, tx_throughput) = collector.network_throughput(name, &sample);
            let (read_iops, write_iops) = collector.disk_iops(name, &sample);
            debug!(
                container = name,
                rx_throughput, tx_throughput, read_iops, write_iops,
                "throughput sample"
            );
            sample
        };

        {
            let mut metrics = self.metrics.write().await;
            let ring = metrics.entry(name.to_string()).or_insert_with(VecDeque::new);
            if ring.len() >= METRICS_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(sample);
        }

        self.storage.insert_metrics(name, &sample).await;

        let health = MetricsCollector::health_score(&sample);
        if health < LOW_HEALTH_WATERMARK {
            warn!(container = name, health, "container health score is low");
        }

        self.check_scaling(name).await;
    }

    /// Respects the scale-up cooldown and the 10-sample minimum before
    /// consulting the Predictor (§4.4.1).
    pub async fn check_scaling(&self, name: &str) {
        {
            let cooldowns = self.scaling_cooldown.read().await;
            if let Some(last) = cooldowns.get(name) {
                if last.elapsed() < Duration::from_secs(self.config.scaling_cooldown_seconds) {
                    return;
                }
            }
        }

        let (cpu_values, memory_values) = {
            let metrics = self.metrics.read().await;
            let Some(ring) = metrics.get(name) else {
                return;
            };
            if ring.len() < MIN_SAMPLES_FOR_DECISION {
                return;
            }
            let window: Vec<&Sample> = ring.iter().rev().take(PREDICTION_WINDOW).collect();
            let cpu: Vec<f64> = window.iter().rev().map(|s| s.cpu_percent).collect();
            let memory: Vec<f64> = window.iter().rev().map(|s| s.memory_percent).collect();
            (cpu, memory)
        };

        let prediction = fleetd_predictor::predict_load(&cpu_values, &memory_values, PREDICTION_HORIZON);
        if prediction.predicted_cpu > self.config.load_threshold || prediction.should_scale {
            self.scaling_cooldown.write().await.insert(name.to_string(), Instant::now());
            self.scale_up(name).await;
        }
    }

    /// Replicates `name` plus every connected target that already has a
    /// fleet entry, then mirrors non-structural edges between freshly
    /// created replica pairs (§4.4.1, §9.2 cascade semantics — preserved
    /// literally rather than redesigned).
    pub async fn scale_up(&self, name: &str) {
        if is_replica(name) {
            return;
        }

        let targets = {
            let graph = self.graph.read().await;
            graph.suggest_scaling_targets(name).all
        };

        let mut created = Vec::new();
        match self.create_replica(name).await {
            Some(replica) => created.push((name.to_string(), replica)),
            None => return,
        }

        for target in &targets {
            if target == name || is_replica(target) {
                continue;
            }
            if !self.fleet.read().await.contains_key(target) {
                continue;
            }
            if let Some(replica) = self.create_replica(target).await {
                created.push((target.clone(), replica));
            }
        }

        let pairs_to_mirror: Vec<(String, String, RelationType, i64)> = {
            let graph = self.graph.read().await;
            let mut pairs = Vec::new();
            for (u, u_replica) in &created {
                for (v, v_replica) in &created {
                    if u == v {
                        continue;
                    }
                    if let Some((relation_type, weight)) = graph.edge(u, v) {
                        if !relation_type.is_master_of() && !relation_type.is_replica_of() {
                            pairs.push((u_replica.clone(), v_replica.clone(), relation_type, weight));
                        }
                    }
                }
            }
            pairs
        };

        for (u_replica, v_replica, relation_type, weight) in pairs_to_mirror {
            self.graph
                .write()
                .await
                .add_edge(&u_replica, &v_replica, relation_type.clone(), weight);
            self.storage
                .upsert_relation(&Relation {
                    from: u_replica,
                    to: v_replica,
                    relation_type,
                    weight,
                })
                .await;
        }

        self.storage
            .append_scaling_event(&ScalingEvent {
                container: name.to_string(),
                kind: ScalingEventKind::ScaleUp,
                details: serde_json::json!({ "targets": targets }),
                timestamp: Utc::now(),
            })
            .await;

        info!(container = name, replicas_created = created.len(), "scale-up completed");
    }

    /// Smallest-`k` replica naming, resolved against both the fleet and the
    /// live runtime so concurrent callers for the same parent never collide
    /// (§5 invariant on `create_replica`).
    pub async fn create_replica(&self, parent: &str) -> Option<String> {
        let (image, env) = {
            let fleet = self.fleet.read().await;
            let instance = fleet.get(parent)?;
            if is_replica(parent) {
                return None;
            }
            if instance.replicas.len() >= self.config.max_replicas_per_container {
                return None;
            }
            (instance.image.clone(), instance.env.clone())
        };

        let mut k = 1u32;
        let replica = loop {
            let candidate = replica_name(parent, k);
            let in_fleet = self.fleet.read().await.contains_key(&candidate);
            let in_runtime = matches!(self.runtime.get(&candidate).await, Ok(Some(_)));
            if !in_fleet && !in_runtime {
                break candidate;
            }
            k += 1;
        };

        let id = match self
            .runtime
            .run(&image, &replica, &env, &self.config.network_name, &[])
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(parent, replica, error = %e, "failed to launch replica");
                return None;
            }
        };

        {
            let mut fleet = self.fleet.write().await;
            fleet.insert(
                replica.clone(),
                Instance::new(id, image.clone(), env.clone(), Some(parent.to_string())),
            );
            if let Some(parent_instance) = fleet.get_mut(parent) {
                parent_instance.replicas.push(replica.clone());
            }
        }
        self.last_request_at.write().await.insert(replica.clone(), Instant::now());

        {
            let mut graph = self.graph.write().await;
            graph.add_node(&replica, None);
            graph.add_edge(parent, &replica, RelationType::replica_of(), 1);
            graph.remove_edge("orchestrator_main", &replica);
        }

        self.storage
            .insert_container_info(&ContainerRecord {
                name: replica.clone(),
                image: image.clone(),
                status: ContainerStatus::Running,
                parent: Some(parent.to_string()),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        self.storage
            .upsert_relation(&Relation {
                from: parent.to_string(),
                to: replica.clone(),
                relation_type: RelationType::replica_of(),
                weight: 1,
            })
            .await;
        self.storage
            .append_scaling_event(&ScalingEvent {
                container: replica.clone(),
                kind: ScalingEventKind::ReplicaCreated,
                details: serde_json::json!({ "parent": parent }),
                timestamp: Utc::now(),
            })
            .await;

        info!(parent, replica, "replica created");
        Some(replica)
    }

    /// Every `IDLE_GC_INTERVAL`, stop and remove replicas idle for
    /// `idle_replica_seconds` at or below `idle_replica_cpu_threshold`
    /// (§4.4.1). One replica's failure never aborts the pass.
    pub async fn idle_replica_gc_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_GC_INTERVAL) => {}
            }
            self.gc_idle_replicas_once().await;
        }
    }

    async fn gc_idle_replicas_once(&self) {
        let replicas: Vec<String> = self.fleet.read().await.keys().filter(|n| is_replica(n)).cloned().collect();

        for name in replicas {
            let idle = match self.last_request_at.read().await.get(&name) {
                Some(t) => t.elapsed() >= Duration::from_secs(self.config.idle_replica_seconds),
                None => false,
            };
            if !idle {
                continue;
            }

            let low_cpu = match self.metrics.read().await.get(&name).and_then(|ring| ring.back()) {
                Some(sample) => sample.cpu_percent <= self.config.idle_replica_cpu_threshold,
                None => true,
            };
            if !low_cpu {
                continue;
            }

            if let Err(e) = self.runtime.stop(&name).await {
                warn!(replica = %name, error = %e, "gc: failed to stop idle replica, continuing");
            }
            if let Err(e) = self.runtime.remove(&name).await {
                warn!(replica = %name, error = %e, "gc: failed to remove idle replica container");
            }

            let parent = self.fleet.write().await.remove(&name).and_then(|i| i.parent);
            if let Some(parent) = &parent {
                if let Some(parent_instance) = self.fleet.write().await.get_mut(parent) {
                    parent_instance.replicas.retain(|r| r != &name);
                }
            }
            self.graph.write().await.remove_node(&name);
            self.last_request_at.write().await.remove(&name);

            self.storage.delete_relations_for(&name).await;
            self.storage.update_container_status(&name, ContainerStatus::Removed).await;

            info!(replica = %name, "idle replica garbage-collected");
        }
    }

    /// Direct dispatch bypasses candidate selection entirely; otherwise picks
    /// the minimum-CPU candidate among `{name} ∪ name.replicas` (§4.4.1).
    ///
    /// Preserved per design note: no special case for `name ==
    /// "orchestrator_main"` — routing to it dispatches to
    /// `http://orchestrator_main:5001/process` like any other target.
    pub async fn route(&self, name: &str, mut payload: serde_json::Value) -> RouteOutcome {
        let direct = payload
            .get("__direct_instance")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if direct {
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("__direct_instance");
            }
            self.last_request_at.write().await.insert(name.to_string(), Instant::now());
            return self.dispatch(name, &payload).await;
        }

        let candidates: Vec<String> = {
            let fleet = self.fleet.read().await;
            let mut candidates = vec![name.to_string()];
            if let Some(instance) = fleet.get(name) {
                candidates.extend(instance.replicas.iter().cloned());
            }
            candidates
        };

        let chosen = {
            let metrics = self.metrics.read().await;
            let mut best: Option<(&str, f64)> = None;
            for candidate in &candidates {
                let score = metrics
                    .get(candidate)
                    .and_then(|ring| ring.back())
                    .map(|s| s.cpu_percent)
                    .unwrap_or(f64::INFINITY);
                match best {
                    Some((_, best_score)) if score >= best_score => {}
                    _ => best = Some((candidate.as_str(), score)),
                }
            }
            best.map(|(n, _)| n.to_string()).unwrap_or_else(|| name.to_string())
        };

        self.last_request_at.write().await.insert(chosen.clone(), Instant::now());
        self.dispatch(&chosen, &payload).await
    }

    async fn dispatch(&self, target: &str, payload: &serde_json::Value) -> RouteOutcome {
        let url = format!("http://{target}:5001/process");
        match self.http.post(&url).json(payload).send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let response = response.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
                RouteOutcome::Dispatched {
                    target: target.to_string(),
                    status_code,
                    response,
                }
            }
            Err(e) => RouteOutcome::Failed {
                target: target.to_string(),
                url,
                error: e.to_string(),
            },
        }
    }

    pub async fn stop_container(&self, name: &str) -> Result<(), FleetError> {
        self.runtime.stop(name).await.map_err(|e| FleetError::Runtime(e.to_string()))?;
        self.storage.update_container_status(name, ContainerStatus::Stopped).await;
        Ok(())
    }

    pub async fn start_container(&self, name: &str) -> Result<(), FleetError> {
        self.runtime.start(name).await.map_err(|e| FleetError::Runtime(e.to_string()))?;
        self.storage.update_container_status(name, ContainerStatus::Running).await;
        Ok(())
    }

    /// Refuses `orchestrator_main`. Returns `"removed"` for a tracked fleet
    /// member, `"removed_from_graph"` when the name only exists as a graph
    /// node (§6 route table).
    pub async fn remove_container(&self, name: &str) -> Result<&'static str, FleetError> {
        if name == "orchestrator_main" {
            return Err(FleetError::InvalidArgument("cannot remove orchestrator_main".to_string()));
        }

        let in_fleet = self.fleet.read().await.contains_key(name);
        if in_fleet {
            if let Err(e) = self.runtime.stop(name).await {
                warn!(container = name, error = %e, "remove: failed to stop container, continuing");
            }
            if let Err(e) = self.runtime.remove(name).await {
                warn!(container = name, error = %e, "remove: failed to remove container, continuing");
            }

            let parent = self.fleet.write().await.remove(name).and_then(|i| i.parent);
            if let Some(parent) = &parent {
                if let Some(parent_instance) = self.fleet.write().await.get_mut(parent) {
                    parent_instance.replicas.retain(|r| r != name);
                }
            }
            self.graph.write().await.remove_node(name);
            self.last_request_at.write().await.remove(name);
            self.storage.delete_relations_for(name).await;
            self.storage.update_container_status(name, ContainerStatus::Removed).await;
            Ok("removed")
        } else if self.graph.read().await.has_node(name) {
            self.graph.write().await.remove_node(name);
            self.storage.delete_relations_for(name).await;
            Ok("removed_from_graph")
        } else {
            Err(FleetError::NotFound(name.to_string()))
        }
    }

    pub async fn list_containers(&self) -> Vec<ContainerSummary> {
        self.fleet
            .read()
            .await
            .iter()
            .map(|(name, instance)| ContainerSummary {
                name: name.clone(),
                id: instance.id.clone(),
                created_at: instance.created_at,
                replicas: instance.replicas.clone(),
            })
            .collect()
    }

    /// Most recent samples first, capped at `limit`.
    pub async fn container_metrics(&self, name: &str, limit: usize) -> Vec<Sample> {
        match self.metrics.read().await.get(name) {
            Some(ring) => ring.iter().rev().take(limit).copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn add_relation(&self, from: &str, to: &str, relation_type: RelationType) {
        self.graph.write().await.add_edge(from, to, relation_type.clone(), 1);
        self.storage
            .upsert_relation(&Relation {
                from: from.to_string(),
                to: to.to_string(),
                relation_type,
                weight: 1,
            })
            .await;
    }

    pub async fn remove_relation(&self, from: &str, to: &str, relation_type: Option<&str>) -> usize {
        self.graph.write().await.remove_edge(from, to);
        self.storage.delete_relation(from, to, relation_type).await
    }

    /// `orchestrator_mongodb` / `orchestrator_web` filtered out, per §6.
    pub async fn graph_export(&self) -> serde_json::Value {
        let mut value = self.graph.read().await.export_to_json();
        let hidden = ["orchestrator_mongodb", "orchestrator_web"];
        if let Some(obj) = value.as_object_mut() {
            if let Some(nodes) = obj.get_mut("nodes").and_then(|v| v.as_array_mut()) {
                nodes.retain(|n| {
                    let id = n.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    !hidden.contains(&id)
                });
            }
            if let Some(links) = obj.get_mut("links").and_then(|v| v.as_array_mut()) {
                links.retain(|l| {
                    let source = l.get("source").and_then(|v| v.as_str()).unwrap_or("");
                    let target = l.get("target").and_then(|v| v.as_str()).unwrap_or("");
                    !hidden.contains(&source) && !hidden.contains(&target)
                });
            }
        }
        value
    }

    pub async fn graph_stats(&self) -> GraphStats {
        self.graph.read().await.get_graph_stats()
    }

    pub async fn scaling_history(&self, name: Option<&str>, limit: usize) -> Vec<ScalingEvent> {
        self.storage.scaling_history(name, limit).await
    }

    /// Optional offline training path (§4.3); never consulted by
    /// `check_scaling`.
    pub async fn train_model(&self, container_name: &str, days: i64) -> Result<TrainingSummary, PredictorError> {
        let window = self.storage.training_window(container_name, days).await;
        let points: Vec<TrainingPoint> = window
            .cpu
            .iter()
            .zip(window.memory.iter())
            .map(|(&cpu_percent, &memory_percent)| TrainingPoint { cpu_percent, memory_percent })
            .collect();
        fleetd_predictor::train(&points)
    }

    /// `(containers_count, replicas_current)`, for the Traffic Driver's
    /// resource surfacing (§4.7).
    pub async fn resource_counts(&self) -> (usize, usize) {
        let fleet = self.fleet.read().await;
        let containers_count = fleet.len();
        let replicas_current = fleet.keys().filter(|n| is_replica(n)).count();
        (containers_count, replicas_current)
    }

    /// Average of the latest sample's CPU% and memory% across every tracked
    /// container with at least one sample.
    pub async fn current_cpu_memory_averages(&self) -> (f64, f64) {
        let metrics = self.metrics.read().await;
        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;
        let mut n = 0usize;
        for ring in metrics.values() {
            if let Some(sample) = ring.back() {
                cpu_sum += sample.cpu_percent;
                memory_sum += sample.memory_percent;
                n += 1;
            }
        }
        if n == 0 {
            (0.0, 0.0)
        } else {
            (cpu_sum / n as f64, memory_sum / n as f64)
        }
    }

    /// Peak memory% over the last 100 samples, per container.
    pub async fn memory_peaks(&self) -> HashMap<String, f64> {
        self.metrics
            .read()
            .await
            .iter()
            .map(|(name, ring)| {
                let peak = ring
                    .iter()
                    .rev()
                    .take(METRICS_RING_CAPACITY)
                    .map(|s| s.memory_percent)
                    .fold(0.0_f64, f64::max);
                (name.clone(), peak)
            })
            .collect()
    }

    pub async fn predict(&self, name: &str) -> Option<PredictionResult> {
        let metrics = self.metrics.read().await;
        let ring = metrics.get(name)?;
        if ring.len() < MIN_SAMPLES_FOR_DECISION {
            return None;
        }
        let window: Vec<&Sample> = ring.iter().rev().take(PREDICTION_WINDOW).collect();
        let cpu: Vec<f64> = window.iter().rev().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = window.iter().rev().map(|s| s.memory_percent).collect();
        Some(fleetd_predictor::predict_load(&cpu, &memory, PREDICTION_HORIZON))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetd_runtime::{ContainerHandle, InspectInfo, RuntimeError};
    use fleetd_storage::{PersistenceAdapter, TrainingWindow};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockRuntime {
        containers: StdMutex<HashMap<String, (String, Vec<String>, String)>>,
        next_id: AtomicU64,
        network: String,
    }

    impl MockRuntime {
        fn new(network: &str) -> Self {
            Self {
                network: network.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RuntimeAdapter for MockRuntime {
        async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(self.containers.lock().unwrap().keys().cloned().collect())
        }

        async fn get(&self, name: &str) -> Result<Option<ContainerHandle>, RuntimeError> {
            Ok(self.containers.lock().unwrap().get(name).map(|(image, _, id)| ContainerHandle {
                id: id.clone(),
                name: name.to_string(),
                image: image.clone(),
                status: "running".into(),
            }))
        }

        async fn inspect(&self, name: &str) -> Result<InspectInfo, RuntimeError> {
            let containers = self.containers.lock().unwrap();
            let (image, env, _) = containers.get(name).ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            Ok(InspectInfo {
                image: image.clone(),
                env: env.clone(),
                networks: vec![self.network.clone()],
            })
        }

        async fn stats_snapshot(&self, name: &str) -> Result<fleetd_metrics::RawStats, RuntimeError> {
            if !self.containers.lock().unwrap().contains_key(name) {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            Ok(fleetd_metrics::RawStats::default())
        }

        async fn run(
            &self,
            image: &str,
            name: &str,
            env: &[String],
            _network: &str,
            _ports: &[PortMapping],
        ) -> Result<String, RuntimeError> {
            let id = format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), (image.to_string(), env.to_vec(), id.clone()));
            Ok(id)
        }

        async fn stop(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn start(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
            self.containers.lock().unwrap().remove(name);
            Ok(())
        }

        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn get_network(&self, _name: &str) -> Result<Vec<String>, RuntimeError> {
            Ok(vec![self.network.clone()])
        }

        async fn self_hostname_container_networks(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(vec![self.network.clone()])
        }
    }

    #[derive(Default)]
    struct MockStorage;

    #[async_trait]
    impl PersistenceAdapter for MockStorage {
        async fn insert_container_info(&self, _record: &ContainerRecord) -> bool {
            true
        }
        async fn update_container_status(&self, _name: &str, _status: ContainerStatus) -> bool {
            true
        }
        async fn list_containers(&self) -> Vec<ContainerRecord> {
            Vec::new()
        }
        async fn insert_metrics(&self, _name: &str, _sample: &Sample) -> bool {
            true
        }
        async fn metrics_range(&self, _name: &str, _t0: chrono::DateTime<Utc>, _t1: chrono::DateTime<Utc>) -> Vec<Sample> {
            Vec::new()
        }
        async fn latest_metrics(&self, _name: &str, _limit: usize) -> Vec<Sample> {
            Vec::new()
        }
        async fn purge_metrics_older_than(&self, _t: chrono::DateTime<Utc>) -> usize {
            0
        }
        async fn training_window(&self, _name: &str, _days: i64) -> TrainingWindow {
            TrainingWindow::default()
        }
        async fn upsert_relation(&self, _relation: &Relation) -> bool {
            true
        }
        async fn delete_relation(&self, _from: &str, _to: &str, _relation_type: Option<&str>) -> usize {
            0
        }
        async fn delete_relations_for(&self, _name: &str) -> usize {
            0
        }
        async fn find_all_relations(&self) -> Vec<Relation> {
            Vec::new()
        }
        async fn append_scaling_event(&self, _event: &ScalingEvent) -> bool {
            true
        }
        async fn scaling_history(&self, _name: Option<&str>, _limit: usize) -> Vec<ScalingEvent> {
            Vec::new()
        }
    }

    fn test_config() -> Config {
        Config {
            load_threshold: 80.0,
            scaling_cooldown_seconds: 60,
            monitor_interval: Duration::from_secs(5),
            max_replicas_per_container: 2,
            idle_replica_seconds: 300,
            idle_replica_cpu_threshold: 5.0,
            network_name: "fleetnet".to_string(),
        }
    }

    async fn orchestrator() -> Orchestrator {
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(MockRuntime::new("fleetnet"));
        let storage: Arc<dyn PersistenceAdapter> = Arc::new(MockStorage::default());
        Orchestrator::new(runtime, storage, test_config()).await
    }

    #[tokio::test]
    async fn create_registers_worker_with_master_of_edge_and_env_defaults() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new())
            .await
            .unwrap();

        let fleet = orch.fleet.read().await;
        let instance = fleet.get("worker1").unwrap();
        assert!(instance.env.iter().any(|e| e == "CONTAINER_NAME=worker1"));
        drop(fleet);

        let graph = orch.graph.read().await;
        assert_eq!(graph.edge("orchestrator_main", "worker1").unwrap().0, RelationType::master_of());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let orch = orchestrator().await;
        orch.create("nginx:latest", "web1", Vec::new(), Vec::new()).await.unwrap();
        let err = orch.create("nginx:latest", "web1", Vec::new(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, FleetError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_replica_picks_smallest_free_index_and_links_parent() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();

        let replica = orch.create_replica("worker1").await.unwrap();
        assert_eq!(replica, "worker1_replica_1");

        let fleet = orch.fleet.read().await;
        assert!(fleet.get("worker1").unwrap().replicas.contains(&replica));
        assert_eq!(fleet.get(&replica).unwrap().parent.as_deref(), Some("worker1"));
    }

    #[tokio::test]
    async fn create_replica_refuses_past_the_cap() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        orch.create_replica("worker1").await.unwrap();
        orch.create_replica("worker1").await.unwrap();
        assert!(orch.create_replica("worker1").await.is_none());
    }

    #[tokio::test]
    async fn create_replica_refuses_replicating_a_replica() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let replica = orch.create_replica("worker1").await.unwrap();
        assert!(orch.create_replica(&replica).await.is_none());
    }

    #[tokio::test]
    async fn route_direct_instance_strips_flag_and_targets_exact_name() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let outcome = orch
            .route("worker1", serde_json::json!({"__direct_instance": true, "complexity": 1}))
            .await;
        match outcome {
            RouteOutcome::Failed { target, .. } => assert_eq!(target, "worker1"),
            RouteOutcome::Dispatched { .. } => panic!("no real worker listening in this test"),
        }
        assert!(orch.last_request_at.read().await.contains_key("worker1"));
    }

    #[tokio::test]
    async fn route_picks_lowest_cpu_candidate_among_replicas() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let replica = orch.create_replica("worker1").await.unwrap();

        {
            let mut metrics = orch.metrics.write().await;
            let mut parent_ring = VecDeque::new();
            parent_ring.push_back(Sample { cpu_percent: 90.0, ..Sample::zeroed_at(Utc::now()) });
            metrics.insert("worker1".to_string(), parent_ring);
            let mut replica_ring = VecDeque::new();
            replica_ring.push_back(Sample { cpu_percent: 5.0, ..Sample::zeroed_at(Utc::now()) });
            metrics.insert(replica.clone(), replica_ring);
        }

        let outcome = orch.route("worker1", serde_json::json!({"complexity": 1})).await;
        let target = match outcome {
            RouteOutcome::Failed { target, .. } => target,
            RouteOutcome::Dispatched { target, .. } => target,
        };
        assert_eq!(target, replica);
    }

    #[tokio::test]
    async fn check_scaling_does_nothing_below_the_sample_floor() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        orch.check_scaling("worker1").await;
        assert!(orch.fleet.read().await.get("worker1").unwrap().replicas.is_empty());
    }

    #[tokio::test]
    async fn check_scaling_triggers_scale_up_on_sustained_high_cpu() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        {
            let mut metrics = orch.metrics.write().await;
            let ring: VecDeque<Sample> = (0..15)
                .map(|_| Sample { cpu_percent: 95.0, ..Sample::zeroed_at(Utc::now()) })
                .collect();
            metrics.insert("worker1".to_string(), ring);
        }
        orch.check_scaling("worker1").await;
        assert_eq!(orch.fleet.read().await.get("worker1").unwrap().replicas.len(), 1);
    }

    #[tokio::test]
    async fn check_scaling_respects_cooldown() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        orch.scaling_cooldown.write().await.insert("worker1".to_string(), Instant::now());
        {
            let mut metrics = orch.metrics.write().await;
            let ring: VecDeque<Sample> = (0..15)
                .map(|_| Sample { cpu_percent: 95.0, ..Sample::zeroed_at(Utc::now()) })
                .collect();
            metrics.insert("worker1".to_string(), ring);
        }
        orch.check_scaling("worker1").await;
        assert!(orch.fleet.read().await.get("worker1").unwrap().replicas.is_empty());
    }

    #[tokio::test]
    async fn remove_container_refuses_orchestrator_main() {
        let orch = orchestrator().await;
        let err = orch.remove_container("orchestrator_main").await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn remove_container_unlinks_from_parent_and_graph() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let replica = orch.create_replica("worker1").await.unwrap();

        assert_eq!(orch.remove_container(&replica).await.unwrap(), "removed");
        assert!(!orch.fleet.read().await.contains_key(&replica));
        assert!(orch.fleet.read().await.get("worker1").unwrap().replicas.is_empty());
        assert!(!orch.graph.read().await.has_node(&replica));
    }

    #[tokio::test]
    async fn idle_gc_removes_replica_past_idle_threshold_with_low_cpu() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let replica = orch.create_replica("worker1").await.unwrap();

        orch.last_request_at
            .write()
            .await
            .insert(replica.clone(), Instant::now() - Duration::from_secs(301));
        {
            let mut metrics = orch.metrics.write().await;
            let mut ring = VecDeque::new();
            ring.push_back(Sample { cpu_percent: 1.0, ..Sample::zeroed_at(Utc::now()) });
            metrics.insert(replica.clone(), ring);
        }

        orch.gc_idle_replicas_once().await;
        assert!(!orch.fleet.read().await.contains_key(&replica));
    }

    #[tokio::test]
    async fn idle_gc_keeps_replica_still_under_cpu_threshold_but_busy() {
        let orch = orchestrator().await;
        orch.create("myapp-worker:latest", "worker1", Vec::new(), Vec::new()).await.unwrap();
        let replica = orch.create_replica("worker1").await.unwrap();

        orch.last_request_at
            .write()
            .await
            .insert(replica.clone(), Instant::now() - Duration::from_secs(301));
        {
            let mut metrics = orch.metrics.write().await;
            let mut ring = VecDeque::new();
            ring.push_back(Sample { cpu_percent: 50.0, ..Sample::zeroed_at(Utc::now()) });
            metrics.insert(replica.clone(), ring);
        }

        orch.gc_idle_replicas_once().await;
        assert!(orch.fleet.read().await.contains_key(&replica));
    }

    #[tokio::test]
    async fn reconcile_prunes_names_absent_from_the_live_runtime() {
        let orch = orchestrator().await;
        orch.create("nginx:latest", "web1", Vec::new(), Vec::new()).await.unwrap();
        orch.reconcile().await;
        assert!(orch.fleet.read().await.contains_key("web1"));

        orch.runtime.remove("web1").await.unwrap();
        orch.reconcile().await;
        assert!(!orch.fleet.read().await.contains_key("web1"));
    }
}
