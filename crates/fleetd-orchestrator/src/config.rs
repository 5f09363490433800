use std::time::Duration;

use fleetd_runtime::RuntimeAdapter;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Orchestrator configuration, entirely environment-driven (§4.4, §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub load_threshold: f64,
    pub scaling_cooldown_seconds: u64,
    pub monitor_interval: Duration,
    pub max_replicas_per_container: usize,
    pub idle_replica_seconds: u64,
    pub idle_replica_cpu_threshold: f64,
    pub network_name: String,
}

impl Config {
    /// Reads every field from the environment except `network_name`, which
    /// needs the runtime adapter to auto-detect (§6 "Network discovery").
    pub async fn from_env(runtime: &dyn RuntimeAdapter) -> Self {
        Self {
            load_threshold: env_or("LOAD_THRESHOLD", 80.0),
            scaling_cooldown_seconds: env_or("SCALING_COOLDOWN", 60),
            monitor_interval: Duration::from_secs(env_or("MONITOR_INTERVAL_SECONDS", 5)),
            max_replicas_per_container: env_or("MAX_REPLICAS_PER_CONTAINER", 2),
            idle_replica_seconds: env_or("IDLE_REPLICA_SECONDS", 300),
            idle_replica_cpu_threshold: env_or("IDLE_REPLICA_CPU_THRESHOLD", 5.0),
            network_name: resolve_network_name(runtime).await,
        }
    }
}

/// `ORCHESTRATOR_NETWORK` env override, else the first network attached to
/// the container named by `HOSTNAME`, else the literal fallback (§6).
///
/// The adapter interface has no network-existence probe, so the
/// "first of these two candidates that the runtime acknowledges" step
/// collapses to the final literal fallback.
pub async fn resolve_network_name(runtime: &dyn RuntimeAdapter) -> String {
    if let Ok(name) = std::env::var("ORCHESTRATOR_NETWORK") {
        if !name.trim().is_empty() {
            return name;
        }
    }
    if let Ok(mut networks) = runtime.self_hostname_container_networks().await {
        if !networks.is_empty() {
            return networks.remove(0);
        }
    }
    "orchestrator_network".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_on_missing_or_unparsable() {
        std::env::remove_var("FLEETD_TEST_KEY");
        assert_eq!(env_or::<u64>("FLEETD_TEST_KEY", 7), 7);
    }
}
