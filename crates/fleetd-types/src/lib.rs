//! Shared data model for the fleet autoscaling orchestrator.
//!
//! Types here are the nouns every other `fleetd-*` crate shares:
//! resource [`Sample`]s, container identity, graph [`Relation`]s, and
//! the append-only [`ScalingEvent`] audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container-host resource naming convention: `<parent>_replica_<k>`, `k >= 1`.
pub const REPLICA_MARKER: &str = "_replica_";

/// Infrastructure identities the orchestrator never tracks as fleet members.
pub const INFRA_NAMES: [&str; 3] = [
    "orchestrator_main",
    "orchestrator_mongodb",
    "orchestrator_web",
];

/// If `name` is a replica (`<parent>_replica_<k>`, `k >= 1`), return `(parent, k)`.
///
/// A name is never its own parent: `parent` itself must not match the replica
/// pattern (replicas are not replicated).
pub fn parse_replica_name(name: &str) -> Option<(&str, u32)> {
    let (parent, suffix) = name.rsplit_once(REPLICA_MARKER)?;
    if parent.is_empty() || parse_replica_name(parent).is_some() {
        return None;
    }
    let k: u32 = suffix.parse().ok()?;
    if k < 1 {
        return None;
    }
    Some((parent, k))
}

pub fn replica_name(parent: &str, k: u32) -> String {
    format!("{parent}{REPLICA_MARKER}{k}")
}

pub fn is_replica(name: &str) -> bool {
    parse_replica_name(name).is_some()
}

/// One immutable, timestamped observation of a container's resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

impl Sample {
    /// The zero-valued default emitted when stats parsing fails (§4.1 failure policy).
    pub fn zeroed_at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_usage: 0,
            memory_limit: 0,
            network_rx: 0,
            network_tx: 0,
            block_read: 0,
            block_write: 0,
        }
    }
}

/// A directed relation type between two container identities.
///
/// `depends_on`, `uses`, `master_of`, and `replica_of` are reserved by the
/// orchestrator; any other label is application-defined (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationType(pub String);

impl RelationType {
    pub fn depends_on() -> Self {
        Self("depends_on".into())
    }

    pub fn uses() -> Self {
        Self("uses".into())
    }

    pub fn master_of() -> Self {
        Self("master_of".into())
    }

    pub fn replica_of() -> Self {
        Self("replica_of".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_master_of(&self) -> bool {
        self.0 == "master_of"
    }

    pub fn is_replica_of(&self) -> bool {
        self.0 == "replica_of"
    }
}

impl From<&str> for RelationType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RelationType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed edge `(from, to, type)`, unique on the triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

/// The kind of append-only scaling audit record (§3 lifecycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventKind {
    ScaleUp,
    ScaleDown,
    ReplicaCreated,
}

/// Append-only audit record `{container, kind, details, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub container: String,
    pub kind: ScalingEventKind,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Container lifecycle status as seen by the orchestrator (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

/// Errors shared across the orchestrator's component boundaries.
///
/// Individual crates add their own narrower error types where useful
/// (e.g. `fleetd-graph::GraphError::CyclePresent`); this is the one that
/// crosses crate boundaries at the orchestrator/runtime/storage seams.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("container '{0}' already exists")]
    AlreadyExists(String),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("'{0}' is a replica and cannot itself be replicated")]
    IsReplica(String),
    #[error("replica cap reached for '{0}'")]
    ReplicaCapReached(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_replica_name() {
        assert_eq!(parse_replica_name("w1_replica_1"), Some(("w1", 1)));
        assert_eq!(parse_replica_name("w1_replica_12"), Some(("w1", 12)));
    }

    #[test]
    fn rejects_non_replica_and_double_replica_names() {
        assert_eq!(parse_replica_name("w1"), None);
        assert_eq!(parse_replica_name("w1_replica_0"), None);
        assert_eq!(parse_replica_name("w1_replica_x"), None);
        // a replica's name must not itself look like a replica of a replica
        assert_eq!(parse_replica_name("w1_replica_1_replica_1"), None);
    }

    #[test]
    fn round_trips_replica_name() {
        let name = replica_name("worker", 3);
        assert_eq!(name, "worker_replica_3");
        assert_eq!(parse_replica_name(&name), Some(("worker", 3)));
        assert!(is_replica(&name));
    }

    #[test]
    fn relation_type_recognizes_reserved_kinds() {
        assert!(RelationType::master_of().is_master_of());
        assert!(RelationType::replica_of().is_replica_of());
        assert!(!RelationType::from("depends_on").is_master_of());
    }
}
