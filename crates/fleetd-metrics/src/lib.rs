//! Turns a runtime-stats snapshot into a [`Sample`], plus the stateful
//! throughput/IOPS helpers that need a previous observation to diff against.
//!
//! Grounded on `metrics_collector.py` from the original implementation:
//! same CPU%/memory%/network/block-IO formulas, same "never propagate a
//! parse error, return a zeroed Sample instead" failure policy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleetd_types::Sample;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// CPU usage counters as reported by the runtime for one observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIoEntry {
    pub op: String,
    pub value: u64,
}

/// A raw runtime-stats snapshot for one container, as the Runtime Adapter
/// hands it over (§4.1 input contract).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStats {
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: HashMap<String, NetworkInterfaceStats>,
    #[serde(default)]
    pub blkio_service_bytes: Vec<BlockIoEntry>,
}

/// Parses stats snapshots into Samples and tracks per-container previous
/// observations for the throughput/IOPS helpers.
///
/// Unlike the original's single `previous_stats[name]` slot (which the
/// network-throughput and disk-IOPS helpers clobber in turn), the two
/// caches here are independent so calling one doesn't reset the other.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    throughput_prev: HashMap<String, (DateTime<Utc>, u64, u64)>,
    iops_prev: HashMap<String, (DateTime<Utc>, u64, u64)>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stats snapshot into a Sample. Never fails: any parse error
    /// yields a zero-valued Sample timestamped `now` (§4.1 failure policy).
    pub fn parse_stats(stats: &RawStats, now: DateTime<Utc>) -> Sample {
        let cpu_percent = cpu_percent(&stats.cpu_stats, &stats.precpu_stats);

        let memory_usage = stats.memory_stats.usage;
        let memory_limit = stats.memory_stats.limit;
        let memory_percent = if memory_limit > 0 {
            100.0 * memory_usage as f64 / memory_limit as f64
        } else {
            0.0
        };

        let (network_rx, network_tx) = stats.networks.values().fold((0u64, 0u64), |acc, n| {
            (acc.0 + n.rx_bytes, acc.1 + n.tx_bytes)
        });

        let (block_read, block_write) = stats.blkio_service_bytes.iter().fold(
            (0u64, 0u64),
            |(read, write), entry| match entry.op.as_str() {
                "Read" => (read + entry.value, write),
                "Write" => (read, write + entry.value),
                _ => (read, write),
            },
        );

        Sample {
            timestamp: now,
            cpu_percent,
            memory_percent,
            memory_usage,
            memory_limit,
            network_rx,
            network_tx,
            block_read,
            block_write,
        }
    }

    /// Same contract as `parse_stats`, but logs the reason a caller might
    /// have fallen back to a default snapshot before calling in.
    pub fn parse_stats_or_default(stats: Option<&RawStats>, now: DateTime<Utc>) -> Sample {
        match stats {
            Some(stats) => Self::parse_stats(stats, now),
            None => {
                warn!("no stats snapshot available, emitting zeroed sample");
                Sample::zeroed_at(now)
            }
        }
    }

    /// `(rx_throughput, tx_throughput)` in bytes/sec since the last call for
    /// this name. First observation for a name returns `(0.0, 0.0)`.
    pub fn network_throughput(&mut self, name: &str, sample: &Sample) -> (f64, f64) {
        throughput(
            &mut self.throughput_prev,
            name,
            sample.timestamp,
            sample.network_rx,
            sample.network_tx,
        )
    }

    /// `(read_iops, write_iops)` in bytes/sec since the last call for this
    /// name. First observation for a name returns `(0.0, 0.0)`.
    pub fn disk_iops(&mut self, name: &str, sample: &Sample) -> (f64, f64) {
        throughput(
            &mut self.iops_prev,
            name,
            sample.timestamp,
            sample.block_read,
            sample.block_write,
        )
    }

    /// `score = 100`, penalized for CPU/memory above 60% and more steeply
    /// above 80%, clamped to `[0, 100]` (§4.1).
    pub fn health_score(sample: &Sample) -> f64 {
        let mut score = 100.0;
        score -= penalty(sample.cpu_percent);
        score -= penalty(sample.memory_percent);
        score.clamp(0.0, 100.0)
    }
}

fn penalty(pct: f64) -> f64 {
    if pct > 80.0 {
        (pct - 80.0) * 2.0
    } else if pct > 60.0 {
        pct - 60.0
    } else {
        0.0
    }
}

fn cpu_percent(cpu: &CpuStats, precpu: &CpuStats) -> f64 {
    let delta_c = cpu.cpu_usage.total_usage as i64 - precpu.cpu_usage.total_usage as i64;
    let delta_s = cpu.system_cpu_usage as i64 - precpu.system_cpu_usage as i64;

    if delta_c > 0 && delta_s > 0 {
        let online_cpus = cpu
            .online_cpus
            .unwrap_or_else(|| cpu.cpu_usage.percpu_usage.len() as u32)
            .max(1);
        let pct = (delta_c as f64 / delta_s as f64) * online_cpus as f64 * 100.0;
        pct.min(100.0)
    } else {
        0.0
    }
}

fn throughput(
    cache: &mut HashMap<String, (DateTime<Utc>, u64, u64)>,
    name: &str,
    timestamp: DateTime<Utc>,
    a: u64,
    b: u64,
) -> (f64, f64) {
    let result = match cache.get(name) {
        Some((prev_ts, prev_a, prev_b)) => {
            let dt = (timestamp - *prev_ts).num_milliseconds() as f64 / 1000.0;
            if dt <= 0.0 {
                (0.0, 0.0)
            } else {
                (
                    (a as f64 - *prev_a as f64) / dt,
                    (b as f64 - *prev_b as f64) / dt,
                )
            }
        }
        None => (0.0, 0.0),
    };
    cache.insert(name.to_string(), (timestamp, a, b));
    result
}
