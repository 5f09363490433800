//! Synthetic load generation jobs and fleet metrics summaries (§4.7).
//!
//! Grounded on `original_source/main_container/orchestrator.py`'s
//! `start_traffic`/`get_metrics_summary` functions, using the
//! `Arc<Mutex<HashMap<...>>>` state-holding idiom from
//! `sx9-cdn-monitoring::GatewayCDN`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fleetd_orchestrator::{Orchestrator, RouteOutcome};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Rolling latency samples kept per job; oldest evicted past this cap.
const LATENCY_CAP: usize = 2000;

#[derive(Debug, Clone)]
struct JobRecord {
    id: String,
    target: String,
    rps: f64,
    complexity: u64,
    duration_seconds: Option<u64>,
    direct: bool,
    started_at: DateTime<Utc>,
    started_ts: f64,
    stopped_at: Option<DateTime<Utc>>,
    stopped_ts: Option<f64>,
    sent: u64,
    errors: u64,
    last_target: Option<String>,
    last_status_code: Option<u16>,
    last_error: Option<String>,
    last_latency_ms: Option<f64>,
    latencies_ms: VecDeque<f64>,
    latency_sum_ms: f64,
    latency_count: u64,
    running: bool,
}

/// Serializable view of a job returned by `start`/`stop`/`list` (§6
/// `/traffic/start`, `/traffic/stop`, `/traffic/status`).
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub target: String,
    pub rps: f64,
    pub complexity: u64,
    pub duration_seconds: Option<u64>,
    pub direct: bool,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub sent: u64,
    pub errors: u64,
    pub last_target: Option<String>,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<f64>,
    pub running: bool,
}

impl From<&JobRecord> for JobSnapshot {
    fn from(r: &JobRecord) -> Self {
        Self {
            id: r.id.clone(),
            target: r.target.clone(),
            rps: r.rps,
            complexity: r.complexity,
            duration_seconds: r.duration_seconds,
            direct: r.direct,
            started_at: r.started_at,
            stopped_at: r.stopped_at,
            sent: r.sent,
            errors: r.errors,
            last_target: r.last_target.clone(),
            last_status_code: r.last_status_code,
            last_error: r.last_error.clone(),
            last_latency_ms: r.last_latency_ms,
            running: r.running,
        }
    }
}

/// Throughput/latency/error figures for one job (§4.7 "Summary").
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub job_id: String,
    pub target: String,
    pub running: bool,
    pub sent: u64,
    pub errors: u64,
    pub throughput_rps: f64,
    pub error_rate_percent: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
}

/// Fleet-wide resource figures surfaced alongside a traffic summary.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub containers_count: usize,
    pub replicas_current: usize,
    pub cpu_average_percent: f64,
    pub memory_average_percent: f64,
    pub memory_peak_percent: HashMap<String, f64>,
}

struct JobHandle {
    record: Mutex<JobRecord>,
    cancel: CancellationToken,
}

/// Owns every traffic-generation job and drives its background loop.
pub struct TrafficDriver {
    orchestrator: Arc<Orchestrator>,
    jobs: Mutex<HashMap<String, Arc<JobHandle>>>,
}

impl TrafficDriver {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new background job and returns its initial snapshot.
    pub fn start(
        &self,
        target: String,
        rps: f64,
        complexity: u64,
        duration_seconds: Option<u64>,
        direct: bool,
    ) -> JobSnapshot {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            target: target.clone(),
            rps: rps.max(0.0),
            complexity,
            duration_seconds,
            direct,
            started_at: now,
            started_ts: now.timestamp_millis() as f64 / 1000.0,
            stopped_at: None,
            stopped_ts: None,
            sent: 0,
            errors: 0,
            last_target: None,
            last_status_code: None,
            last_error: None,
            last_latency_ms: None,
            latencies_ms: VecDeque::new(),
            latency_sum_ms: 0.0,
            latency_count: 0,
            running: true,
        };
        let snapshot = JobSnapshot::from(&record);
        let handle = Arc::new(JobHandle {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
        });
        self.jobs.lock().unwrap().insert(id.clone(), handle.clone());

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            run_job(orchestrator, handle).await;
        });

        info!(job_id = %id, %target, rps, "traffic job started");
        snapshot
    }

    /// Signals a running job to stop and returns its snapshot as of the
    /// call, or `None` if no job with that id exists.
    pub fn stop(&self, id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        let handle = jobs.get(id)?.clone();
        drop(jobs);
        handle.cancel.cancel();
        let record = handle.record.lock().unwrap();
        Some(JobSnapshot::from(&*record))
    }

    /// All jobs, oldest-started first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        let mut snapshots: Vec<JobSnapshot> = jobs
            .values()
            .map(|h| JobSnapshot::from(&*h.record.lock().unwrap()))
            .collect();
        drop(jobs);
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Summary for `job_id`, or the most recently started job when `None`.
    /// Returns `None` if no job matches (or none exist).
    pub fn traffic_summary(&self, job_id: Option<&str>) -> Option<TrafficSummary> {
        let jobs = self.jobs.lock().unwrap();
        let handle = match job_id {
            Some(id) => jobs.get(id)?.clone(),
            None => jobs
                .values()
                .max_by(|a, b| {
                    let ra = a.record.lock().unwrap().started_ts;
                    let rb = b.record.lock().unwrap().started_ts;
                    ra.partial_cmp(&rb).unwrap()
                })?
                .clone(),
        };
        drop(jobs);
        let record = handle.record.lock().unwrap().clone();

        let now_ts = Utc::now().timestamp_millis() as f64 / 1000.0;
        let elapsed = if record.running {
            (now_ts - record.started_ts).max(0.001)
        } else {
            record
                .stopped_ts
                .map(|t| (t - record.started_ts).max(0.001))
                .unwrap_or(0.001)
        };
        let throughput_rps = record.sent as f64 / elapsed;
        let total = record.sent + record.errors;
        let error_rate_percent = if total == 0 {
            0.0
        } else {
            record.errors as f64 / total as f64 * 100.0
        };
        let mean_latency_ms = if record.latency_count == 0 {
            0.0
        } else {
            record.latency_sum_ms / record.latency_count as f64
        };
        let (p50, p95, p99) = match percentiles(&record.latencies_ms) {
            Some((p50, p95, p99)) => (Some(p50), Some(p95), Some(p99)),
            None => (None, None, None),
        };

        Some(TrafficSummary {
            job_id: record.id,
            target: record.target,
            running: record.running,
            sent: record.sent,
            errors: record.errors,
            throughput_rps,
            error_rate_percent,
            mean_latency_ms,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
        })
    }

    /// Fleet-wide CPU/memory/replica figures, independent of any job.
    pub async fn resource_summary(&self) -> ResourceSummary {
        let (containers_count, replicas_current) = self.orchestrator.resource_counts().await;
        let (cpu_average_percent, memory_average_percent) =
            self.orchestrator.current_cpu_memory_averages().await;
        let memory_peak_percent = self.orchestrator.memory_peaks().await;
        ResourceSummary {
            containers_count,
            replicas_current,
            cpu_average_percent,
            memory_average_percent,
            memory_peak_percent,
        }
    }
}

async fn run_job(orchestrator: Arc<Orchestrator>, handle: Arc<JobHandle>) {
    let (target, complexity, direct, rps, duration_seconds) = {
        let record = handle.record.lock().unwrap();
        (
            record.target.clone(),
            record.complexity,
            record.direct,
            record.rps,
            record.duration_seconds,
        )
    };
    let deadline = duration_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        if handle.cancel.is_cancelled() {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        let mut payload = serde_json::json!({ "complexity": complexity });
        if direct {
            payload["__direct_instance"] = serde_json::Value::Bool(true);
        }

        let t0 = Instant::now();
        let outcome = orchestrator.route(&target, payload).await;
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;

        {
            let mut record = handle.record.lock().unwrap();
            if record.latencies_ms.len() >= LATENCY_CAP {
                record.latencies_ms.pop_front();
            }
            record.latencies_ms.push_back(elapsed_ms);
            record.latency_sum_ms += elapsed_ms;
            record.latency_count += 1;
            record.last_latency_ms = Some(elapsed_ms);
            match outcome {
                RouteOutcome::Dispatched {
                    target,
                    status_code,
                    ..
                } => {
                    record.last_target = Some(target);
                    record.last_status_code = Some(status_code);
                    record.last_error = None;
                    record.sent += 1;
                }
                RouteOutcome::Failed { target, error, .. } => {
                    record.last_target = Some(target);
                    record.last_status_code = None;
                    record.last_error = Some(error);
                    record.errors += 1;
                }
            }
        }

        if handle.cancel.is_cancelled() {
            break;
        }
        if rps > 0.0 {
            let delay = Duration::from_secs_f64(1.0 / rps);
            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let mut record = handle.record.lock().unwrap();
    record.running = false;
    let now = Utc::now();
    record.stopped_at = Some(now);
    record.stopped_ts = Some(now.timestamp_millis() as f64 / 1000.0);
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = idx - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

fn percentiles(latencies: &VecDeque<f64>) -> Option<(f64, f64, f64)> {
    if latencies.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = latencies.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Some((
        percentile(&sorted, 0.50),
        percentile(&sorted, 0.95),
        percentile(&sorted, 0.99),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_interpolate_linearly_over_a_small_sample() {
        let mut latencies = VecDeque::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            latencies.push_back(v);
        }
        let (p50, p95, p99) = percentiles(&latencies).unwrap();
        assert_eq!(p50, 30.0);
        assert!((p95 - 48.0).abs() < 1e-9);
        assert!((p99 - 49.6).abs() < 1e-9);
    }

    #[test]
    fn percentiles_are_none_for_an_empty_buffer() {
        assert!(percentiles(&VecDeque::new()).is_none());
    }

    #[test]
    fn latency_cap_evicts_oldest_sample() {
        let mut latencies = VecDeque::new();
        for i in 0..LATENCY_CAP + 5 {
            if latencies.len() >= LATENCY_CAP {
                latencies.pop_front();
            }
            latencies.push_back(i as f64);
        }
        assert_eq!(latencies.len(), LATENCY_CAP);
        assert_eq!(*latencies.front().unwrap(), 5.0);
    }
}
