use serde::Deserialize;

fn default_rps() -> f64 {
    5.0
}
fn default_complexity() -> u64 {
    1
}
fn default_direct() -> bool {
    true
}
fn default_days() -> i64 {
    7
}
fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct PortMappingBody {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerBody {
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMappingBody>,
}

#[derive(Debug, Deserialize)]
pub struct RelationBody {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrafficStartBody {
    pub target: String,
    #[serde(default = "default_rps")]
    pub rps: f64,
    #[serde(default = "default_complexity")]
    pub complexity: u64,
    pub duration_seconds: Option<u64>,
    #[serde(default = "default_direct")]
    pub direct: bool,
}

#[derive(Debug, Deserialize)]
pub struct TrafficStopBody {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MetricsSummaryQuery {
    pub traffic_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScalingHistoryQuery {
    pub container: Option<String>,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct MlTrainBody {
    pub container_name: String,
    #[serde(default = "default_days")]
    pub days: i64,
}
