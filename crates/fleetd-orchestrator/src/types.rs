use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-live-container record held in `fleet` (§3 "Instance record").
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub image: String,
    pub env: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub parent: Option<String>,
    pub replicas: Vec<String>,
}

impl Instance {
    pub fn new(id: String, image: String, env: Vec<String>, parent: Option<String>) -> Self {
        Self {
            id,
            image,
            env,
            created_at: Utc::now(),
            parent,
            replicas: Vec::new(),
        }
    }
}

/// A serializable view of `Instance` for `/containers/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub name: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub replicas: Vec<String>,
}

/// Outcome of `route()`: the dispatch either completed at the transport
/// layer (any HTTP status) or failed before/while sending (§4.4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RouteOutcome {
    Dispatched {
        target: String,
        status_code: u16,
        response: serde_json::Value,
    },
    Failed {
        target: String,
        url: String,
        error: String,
    },
}
