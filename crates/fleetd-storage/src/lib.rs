//! Persistence adapter: interface plus a `sled`-backed, best-effort
//! implementation.
//!
//! Grounded on `mongo_handler.py` for the four collections and their
//! operations, but the external MongoDB collaborator it talks to is out of
//! scope — `sled` gives the same "observability tier, no durability
//! guarantee" role without a second process to stand up.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd_types::{ContainerStatus, Relation, Sample, ScalingEvent};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A persisted container record (`containers` collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parallel-array training window, as `get_training_data` returns it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingWindow {
    pub timestamps: Vec<DateTime<Utc>>,
    pub cpu: Vec<f64>,
    pub memory: Vec<f64>,
    pub network_rx: Vec<u64>,
    pub network_tx: Vec<u64>,
}

/// Every operation here is best-effort from the orchestrator's perspective:
/// implementations must not raise at the call site and must not block the
/// caller indefinitely. In-memory state, not this adapter, is authoritative
/// (§4.5).
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn insert_container_info(&self, record: &ContainerRecord) -> bool;
    async fn update_container_status(&self, name: &str, status: ContainerStatus) -> bool;
    async fn list_containers(&self) -> Vec<ContainerRecord>;

    async fn insert_metrics(&self, name: &str, sample: &Sample) -> bool;
    async fn metrics_range(&self, name: &str, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Vec<Sample>;
    async fn latest_metrics(&self, name: &str, limit: usize) -> Vec<Sample>;
    async fn purge_metrics_older_than(&self, t: DateTime<Utc>) -> usize;
    async fn training_window(&self, name: &str, days: i64) -> TrainingWindow;

    async fn upsert_relation(&self, relation: &Relation) -> bool;
    async fn delete_relation(&self, from: &str, to: &str, relation_type: Option<&str>) -> usize;
    async fn delete_relations_for(&self, name: &str) -> usize;
    async fn find_all_relations(&self) -> Vec<Relation>;

    async fn append_scaling_event(&self, event: &ScalingEvent) -> bool;
    async fn scaling_history(&self, name: Option<&str>, limit: usize) -> Vec<ScalingEvent>;
}

/// `sled`-backed implementation. Every public method swallows its own
/// errors, logs them, and returns the documented best-effort fallback
/// (`false`, `0`, or an empty collection) rather than propagating.
pub struct SledStorage {
    containers: sled::Tree,
    metrics: sled::Tree,
    relations: sled::Tree,
    scaling_events: sled::Tree,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            containers: db.open_tree("containers")?,
            metrics: db.open_tree("metrics")?,
            relations: db.open_tree("relations")?,
            scaling_events: db.open_tree("scaling_events")?,
        })
    }

    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            containers: db.open_tree("containers")?,
            metrics: db.open_tree("metrics")?,
            relations: db.open_tree("relations")?,
            scaling_events: db.open_tree("scaling_events")?,
        })
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn metrics_key(name: &str, timestamp: DateTime<Utc>) -> Vec<u8> {
        let mut key = name.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&timestamp.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        key
    }

    fn relation_key(relation: &Relation) -> Vec<u8> {
        format!("{}\0{}\0{}", relation.from, relation.to, relation.relation_type).into_bytes()
    }

    fn scaling_key(name: &str, timestamp: DateTime<Utc>) -> Vec<u8> {
        let mut key = name.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&timestamp.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        key
    }
}

#[async_trait]
impl PersistenceAdapter for SledStorage {
    async fn insert_container_info(&self, record: &ContainerRecord) -> bool {
        let result = serde_json::to_vec(record)
            .map_err(StorageError::from)
            .and_then(|bytes| Ok(self.containers.insert(record.name.as_bytes(), bytes)?));
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(container = %record.name, error = %e, "failed to persist container info");
                false
            }
        }
    }

    async fn update_container_status(&self, name: &str, status: ContainerStatus) -> bool {
        let Ok(Some(existing)) = self.containers.get(name.as_bytes()) else {
            return false;
        };
        let Ok(mut record) = serde_json::from_slice::<ContainerRecord>(&existing) else {
            return false;
        };
        record.status = status;
        record.updated_at = Utc::now();
        self.insert_container_info(&record).await
    }

    async fn list_containers(&self) -> Vec<ContainerRecord> {
        self.containers
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .collect()
    }

    async fn insert_metrics(&self, name: &str, sample: &Sample) -> bool {
        let key = Self::metrics_key(name, sample.timestamp);
        match serde_json::to_vec(sample) {
            Ok(bytes) => self.metrics.insert(key, bytes).is_ok(),
            Err(e) => {
                warn!(container = name, error = %e, "failed to persist sample");
                false
            }
        }
    }

    async fn metrics_range(&self, name: &str, t0: DateTime<Utc>, t1: DateTime<Utc>) -> Vec<Sample> {
        let lo = Self::metrics_key(name, t0);
        let hi = Self::metrics_key(name, t1);
        self.metrics
            .range(lo..=hi)
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .collect()
    }

    async fn latest_metrics(&self, name: &str, limit: usize) -> Vec<Sample> {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(0);
        let mut samples: Vec<Sample> = self
            .metrics
            .scan_prefix(prefix)
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .collect();
        samples.sort_by_key(|s: &Sample| std::cmp::Reverse(s.timestamp));
        samples.truncate(limit);
        samples
    }

    async fn purge_metrics_older_than(&self, t: DateTime<Utc>) -> usize {
        let mut purged = 0;
        let mut to_remove = Vec::new();
        for entry in self.metrics.iter() {
            let Ok((key, value)) = entry else { continue };
            if let Ok(sample) = serde_json::from_slice::<Sample>(&value) {
                if sample.timestamp < t {
                    to_remove.push(key);
                }
            }
        }
        for key in to_remove {
            if self.metrics.remove(key).is_ok() {
                purged += 1;
            }
        }
        purged
    }

    async fn training_window(&self, name: &str, days: i64) -> TrainingWindow {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut window = TrainingWindow::default();
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(0);
        let mut samples: Vec<Sample> = self
            .metrics
            .scan_prefix(prefix)
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .filter(|s: &Sample| s.timestamp >= cutoff)
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        for sample in samples {
            window.timestamps.push(sample.timestamp);
            window.cpu.push(sample.cpu_percent);
            window.memory.push(sample.memory_percent);
            window.network_rx.push(sample.network_rx);
            window.network_tx.push(sample.network_tx);
        }
        window
    }

    async fn upsert_relation(&self, relation: &Relation) -> bool {
        let key = Self::relation_key(relation);
        if self.relations.contains_key(&key).unwrap_or(false) {
            return true;
        }
        match serde_json::to_vec(relation) {
            Ok(bytes) => self.relations.insert(key, bytes).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to persist relation");
                false
            }
        }
    }

    async fn delete_relation(&self, from: &str, to: &str, relation_type: Option<&str>) -> usize {
        let mut deleted = 0;
        let mut to_remove = Vec::new();
        for entry in self.relations.iter() {
            let Ok((key, value)) = entry else { continue };
            let Ok(relation) = serde_json::from_slice::<Relation>(&value) else {
                continue;
            };
            let type_matches = relation_type.map_or(true, |t| relation.relation_type.as_str() == t);
            if relation.from == from && relation.to == to && type_matches {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            if self.relations.remove(key).is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    async fn delete_relations_for(&self, name: &str) -> usize {
        let mut deleted = 0;
        let mut to_remove = Vec::new();
        for entry in self.relations.iter() {
            let Ok((key, value)) = entry else { continue };
            let Ok(relation) = serde_json::from_slice::<Relation>(&value) else {
                continue;
            };
            if relation.from == name || relation.to == name {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            if self.relations.remove(key).is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    async fn find_all_relations(&self) -> Vec<Relation> {
        self.relations
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .collect()
    }

    async fn append_scaling_event(&self, event: &ScalingEvent) -> bool {
        let key = Self::scaling_key(&event.container, event.timestamp);
        match serde_json::to_vec(event) {
            Ok(bytes) => self.scaling_events.insert(key, bytes).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to persist scaling event");
                false
            }
        }
    }

    async fn scaling_history(&self, name: Option<&str>, limit: usize) -> Vec<ScalingEvent> {
        let mut events: Vec<ScalingEvent> = self
            .scaling_events
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice(&v).ok())
            .filter(|e: &ScalingEvent| name.map_or(true, |n| e.container == n))
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        events.truncate(limit);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_types::{RelationType, ScalingEventKind};

    fn sample_at(t: DateTime<Utc>, cpu: f64) -> Sample {
        let mut s = Sample::zeroed_at(t);
        s.cpu_percent = cpu;
        s
    }

    #[tokio::test]
    async fn container_round_trip_and_status_update() {
        let storage = SledStorage::open_temporary().unwrap();
        let record = ContainerRecord {
            name: "worker1".into(),
            image: "worker:latest".into(),
            status: ContainerStatus::Running,
            parent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(storage.insert_container_info(&record).await);
        assert!(storage.update_container_status("worker1", ContainerStatus::Stopped).await);
        let listed = storage.list_containers().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn latest_metrics_orders_newest_first_and_respects_limit() {
        let storage = SledStorage::open_temporary().unwrap();
        let t0 = Utc::now();
        for i in 0..5 {
            let sample = sample_at(t0 + chrono::Duration::seconds(i), i as f64);
            assert!(storage.insert_metrics("worker1", &sample).await);
        }
        let latest = storage.latest_metrics("worker1", 2).await;
        assert_eq!(latest.len(), 2);
        assert!(latest[0].cpu_percent > latest[1].cpu_percent);
    }

    #[tokio::test]
    async fn purge_metrics_older_than_removes_only_stale_points() {
        let storage = SledStorage::open_temporary().unwrap();
        let old = Utc::now() - chrono::Duration::days(40);
        let recent = Utc::now();
        storage.insert_metrics("w", &sample_at(old, 1.0)).await;
        storage.insert_metrics("w", &sample_at(recent, 2.0)).await;
        let purged = storage.purge_metrics_older_than(Utc::now() - chrono::Duration::days(30)).await;
        assert_eq!(purged, 1);
        assert_eq!(storage.latest_metrics("w", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn relation_upsert_is_idempotent_on_the_triple() {
        let storage = SledStorage::open_temporary().unwrap();
        let relation = Relation {
            from: "a".into(),
            to: "b".into(),
            relation_type: RelationType::depends_on(),
            weight: 1,
        };
        assert!(storage.upsert_relation(&relation).await);
        assert!(storage.upsert_relation(&relation).await);
        assert_eq!(storage.find_all_relations().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_relations_for_removes_both_directions() {
        let storage = SledStorage::open_temporary().unwrap();
        storage
            .upsert_relation(&Relation {
                from: "a".into(),
                to: "b".into(),
                relation_type: RelationType::depends_on(),
                weight: 1,
            })
            .await;
        storage
            .upsert_relation(&Relation {
                from: "c".into(),
                to: "a".into(),
                relation_type: RelationType::uses(),
                weight: 1,
            })
            .await;
        let deleted = storage.delete_relations_for("a").await;
        assert_eq!(deleted, 2);
        assert!(storage.find_all_relations().await.is_empty());
    }

    #[tokio::test]
    async fn scaling_history_filters_by_name_and_orders_newest_first() {
        let storage = SledStorage::open_temporary().unwrap();
        let t0 = Utc::now();
        storage
            .append_scaling_event(&ScalingEvent {
                container: "a".into(),
                kind: ScalingEventKind::ScaleUp,
                details: serde_json::json!({}),
                timestamp: t0,
            })
            .await;
        storage
            .append_scaling_event(&ScalingEvent {
                container: "b".into(),
                kind: ScalingEventKind::ScaleUp,
                details: serde_json::json!({}),
                timestamp: t0 + chrono::Duration::seconds(1),
            })
            .await;
        let history = storage.scaling_history(Some("a"), 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].container, "a");
    }
}
