//! Directed relation graph over container identities.
//!
//! Grounded on `graph_manager.py` (networkx `DiGraph` wrapper) from the
//! original implementation, reworked per the documented design note: stable
//! integer node ids plus a name→id map, edges in a map keyed on `(u, v)`
//! rather than pointer-linked nodes.

use std::collections::{HashMap, HashSet, VecDeque};

use fleetd_types::RelationType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph contains a cycle, no topological order exists")]
    CyclePresent,
    #[error("node '{0}' not found")]
    NotFound(String),
    #[error("malformed node-link payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
struct EdgeRecord {
    relation_type: RelationType,
    weight: i64,
}

/// Everything `suggest_scaling_targets` returns for one container (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingTargets {
    pub immediate: Vec<String>,
    pub descendants: Vec<String>,
    pub ancestors: Vec<String>,
    pub all: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_containers: usize,
    pub total_relations: usize,
    pub is_connected: bool,
    pub has_cycles: bool,
    pub density: f64,
    pub critical_containers: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct NodeLinkNode {
    id: String,
    #[serde(flatten)]
    metadata: Value,
}

#[derive(Serialize, Deserialize)]
struct NodeLinkEdge {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation_type: String,
    #[serde(default = "one")]
    weight: i64,
}

fn one() -> i64 {
    1
}

#[derive(Serialize, Deserialize)]
struct NodeLinkGraph {
    nodes: Vec<NodeLinkNode>,
    links: Vec<NodeLinkEdge>,
}

/// A directed graph over container identities, with per-edge type and weight.
///
/// All operations documented here run in `O(V + E)` worst case. The graph
/// is authoritative for structure; persistence (C5) mirrors it
/// asynchronously and is never consulted to answer a graph query.
#[derive(Debug, Default)]
pub struct Graph {
    next_id: u64,
    ids: HashMap<String, u64>,
    names: HashMap<u64, String>,
    metadata: HashMap<u64, Value>,
    out_edges: HashMap<u64, HashSet<u64>>,
    in_edges: HashMap<u64, HashSet<u64>>,
    edges: HashMap<(u64, u64), EdgeRecord>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_of(&self, name: &str) -> Option<u64> {
        self.ids.get(name).copied()
    }

    /// Add a node if it doesn't already exist. Idempotent; re-adding an
    /// existing node with `metadata` overwrites its stored metadata.
    pub fn add_node(&mut self, name: &str, metadata: Option<Value>) {
        let id = *self.ids.entry(name.to_string()).or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            self.names.insert(id, name.to_string());
            self.out_edges.insert(id, HashSet::new());
            self.in_edges.insert(id, HashSet::new());
            id
        });
        if let Some(metadata) = metadata {
            self.metadata.insert(id, metadata);
        }
    }

    /// Remove a node and every edge touching it. No-op if absent.
    pub fn remove_node(&mut self, name: &str) {
        let Some(id) = self.id_of(name) else {
            return;
        };
        let succs: Vec<u64> = self.out_edges.get(&id).cloned().unwrap_or_default().into_iter().collect();
        let preds: Vec<u64> = self.in_edges.get(&id).cloned().unwrap_or_default().into_iter().collect();
        for s in succs {
            self.edges.remove(&(id, s));
            if let Some(set) = self.in_edges.get_mut(&s) {
                set.remove(&id);
            }
        }
        for p in preds {
            self.edges.remove(&(p, id));
            if let Some(set) = self.out_edges.get_mut(&p) {
                set.remove(&id);
            }
        }
        self.out_edges.remove(&id);
        self.in_edges.remove(&id);
        self.names.remove(&id);
        self.metadata.remove(&id);
        self.ids.remove(name);
    }

    /// Auto-creates `u` and `v` if either is missing.
    pub fn add_edge(&mut self, u: &str, v: &str, relation_type: RelationType, weight: i64) {
        self.add_node(u, None);
        self.add_node(v, None);
        let uid = self.id_of(u).expect("just inserted");
        let vid = self.id_of(v).expect("just inserted");
        self.out_edges.get_mut(&uid).unwrap().insert(vid);
        self.in_edges.get_mut(&vid).unwrap().insert(uid);
        self.edges
            .insert((uid, vid), EdgeRecord { relation_type, weight });
    }

    /// The type and weight of the edge `u -> v`, if one exists.
    pub fn edge(&self, u: &str, v: &str) -> Option<(RelationType, i64)> {
        let uid = self.id_of(u)?;
        let vid = self.id_of(v)?;
        self.edges
            .get(&(uid, vid))
            .map(|record| (record.relation_type.clone(), record.weight))
    }

    /// Returns whether an edge existed.
    pub fn remove_edge(&mut self, u: &str, v: &str) -> bool {
        let (Some(uid), Some(vid)) = (self.id_of(u), self.id_of(v)) else {
            return false;
        };
        let existed = self.edges.remove(&(uid, vid)).is_some();
        if existed {
            if let Some(set) = self.out_edges.get_mut(&uid) {
                set.remove(&vid);
            }
            if let Some(set) = self.in_edges.get_mut(&vid) {
                set.remove(&uid);
            }
        }
        existed
    }

    /// Remove every node not present in `alive`.
    pub fn prune_to(&mut self, alive: &[String]) {
        let keep: HashSet<&str> = alive.iter().map(String::as_str).collect();
        let to_remove: Vec<String> = self
            .ids
            .keys()
            .filter(|name| !keep.contains(name.as_str()))
            .cloned()
            .collect();
        for name in to_remove {
            self.remove_node(&name);
        }
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    /// Union of successors and predecessors: the direct relations of `n`.
    pub fn neighbors(&self, n: &str) -> Vec<String> {
        let Some(id) = self.id_of(n) else {
            return Vec::new();
        };
        let mut set: HashSet<u64> = self.out_edges.get(&id).cloned().unwrap_or_default();
        set.extend(self.in_edges.get(&id).cloned().unwrap_or_default());
        set.into_iter().filter_map(|id| self.names.get(&id).cloned()).collect()
    }

    /// Transitive closure of successors, excluding `n` itself.
    pub fn descendants(&self, n: &str) -> Vec<String> {
        self.reachable(n, &self.out_edges)
    }

    /// Transitive closure of predecessors, excluding `n` itself.
    pub fn ancestors(&self, n: &str) -> Vec<String> {
        self.reachable(n, &self.in_edges)
    }

    fn reachable(&self, n: &str, adjacency: &HashMap<u64, HashSet<u64>>) -> Vec<String> {
        let Some(start) = self.id_of(n) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = adjacency.get(&current) {
                for &id in next {
                    if visited.insert(id) {
                        queue.push_back(id);
                    }
                }
            }
        }
        visited.remove(&start);
        visited.into_iter().filter_map(|id| self.names.get(&id).cloned()).collect()
    }

    /// Kahn's algorithm. Fails with `CyclePresent` if any simple cycle exists.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<u64, usize> = self
            .names
            .keys()
            .map(|&id| (id, self.in_edges.get(&id).map_or(0, HashSet::len)))
            .collect();
        let mut queue: VecDeque<u64> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(succs) = self.out_edges.get(&id) {
                for &next in succs {
                    let deg = in_degree.get_mut(&next).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        if order.len() != self.names.len() {
            return Err(GraphError::CyclePresent);
        }
        Ok(order.into_iter().filter_map(|id| self.names.get(&id).cloned()).collect())
    }

    /// Enumerate all elementary cycles. Each vertex in the induced subgraph
    /// restricted to ids `>= start` is explored from its smallest-id member,
    /// so every cycle is reported exactly once.
    pub fn simple_cycles(&self) -> Vec<Vec<String>> {
        let mut result = Vec::new();
        let mut ids: Vec<u64> = self.names.keys().copied().collect();
        ids.sort_unstable();
        for &start in &ids {
            let mut path = vec![start];
            let mut blocked = HashSet::new();
            self.cycle_dfs(start, start, &mut path, &mut blocked, &mut result);
        }
        result
    }

    fn cycle_dfs(
        &self,
        start: u64,
        current: u64,
        path: &mut Vec<u64>,
        blocked: &mut HashSet<u64>,
        out: &mut Vec<Vec<String>>,
    ) {
        blocked.insert(current);
        if let Some(succs) = self.out_edges.get(&current) {
            let mut succs: Vec<u64> = succs.iter().copied().collect();
            succs.sort_unstable();
            for next in succs {
                if next == start {
                    out.push(path.iter().filter_map(|id| self.names.get(id).cloned()).collect());
                } else if next > start && !blocked.contains(&next) {
                    path.push(next);
                    self.cycle_dfs(start, next, path, blocked, out);
                    path.pop();
                }
            }
        }
        blocked.remove(&current);
    }

    /// Whether the graph, viewed as undirected, is a single connected
    /// component (or empty/singleton).
    pub fn is_weakly_connected(&self) -> bool {
        let Some(&start) = self.names.keys().next() else {
            return true;
        };
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(current) = queue.pop_front() {
            let mut adjacent: HashSet<u64> = self.out_edges.get(&current).cloned().unwrap_or_default();
            adjacent.extend(self.in_edges.get(&current).cloned().unwrap_or_default());
            for id in adjacent {
                if visited.insert(id) {
                    queue.push_back(id);
                }
            }
        }
        visited.len() == self.names.len()
    }

    /// Nodes whose removal disconnects a currently weakly-connected graph.
    /// If the graph is not already weakly connected, returns an empty set.
    pub fn critical_nodes(&self) -> Vec<String> {
        if !self.is_weakly_connected() {
            return Vec::new();
        }
        let mut critical = Vec::new();
        for (&id, name) in &self.names {
            if self.weakly_connected_excluding(id) {
                continue;
            }
            critical.push(name.clone());
        }
        critical
    }

    fn weakly_connected_excluding(&self, excluded: u64) -> bool {
        let remaining: Vec<u64> = self.names.keys().copied().filter(|&id| id != excluded).collect();
        let Some(&start) = remaining.first() else {
            return true;
        };
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(current) = queue.pop_front() {
            let mut adjacent: HashSet<u64> = self.out_edges.get(&current).cloned().unwrap_or_default();
            adjacent.extend(self.in_edges.get(&current).cloned().unwrap_or_default());
            for id in adjacent {
                if id != excluded && visited.insert(id) {
                    queue.push_back(id);
                }
            }
        }
        visited.len() == remaining.len()
    }

    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn density(&self) -> f64 {
        let n = self.names.len();
        if n < 2 {
            return 0.0;
        }
        self.edges.len() as f64 / (n * (n - 1)) as f64
    }

    pub fn get_graph_stats(&self) -> GraphStats {
        GraphStats {
            total_containers: self.node_count(),
            total_relations: self.edge_count(),
            is_connected: self.is_weakly_connected(),
            has_cycles: !self.simple_cycles().is_empty(),
            density: self.density(),
            critical_containers: self.critical_nodes(),
        }
    }

    /// `{ immediate: neighbors(n), descendants, ancestors, all: union }` (§4.2).
    pub fn suggest_scaling_targets(&self, n: &str) -> ScalingTargets {
        let immediate = self.neighbors(n);
        let descendants = self.descendants(n);
        let ancestors = self.ancestors(n);
        let mut all: HashSet<String> = HashSet::new();
        all.extend(immediate.iter().cloned());
        all.extend(descendants.iter().cloned());
        all.extend(ancestors.iter().cloned());
        ScalingTargets {
            immediate,
            descendants,
            ancestors,
            all: all.into_iter().collect(),
        }
    }

    /// `{ nodes: [{id, ...}], links: [{source, target, type, weight}] }`.
    pub fn export_to_json(&self) -> Value {
        let nodes: Vec<NodeLinkNode> = self
            .names
            .iter()
            .map(|(id, name)| NodeLinkNode {
                id: name.clone(),
                metadata: self.metadata.get(id).cloned().unwrap_or(Value::Null),
            })
            .collect();
        let links: Vec<NodeLinkEdge> = self
            .edges
            .iter()
            .map(|(&(u, v), record)| NodeLinkEdge {
                source: self.names[&u].clone(),
                target: self.names[&v].clone(),
                relation_type: record.relation_type.as_str().to_string(),
                weight: record.weight,
            })
            .collect();
        serde_json::to_value(NodeLinkGraph { nodes, links }).unwrap_or(Value::Null)
    }

    pub fn import_from_json(json: &Value) -> Result<Self, GraphError> {
        let parsed: NodeLinkGraph = serde_json::from_value(json.clone())
            .map_err(|e| GraphError::Malformed(e.to_string()))?;
        let mut graph = Self::new();
        for node in parsed.nodes {
            let metadata = if node.metadata.is_null() { None } else { Some(node.metadata) };
            graph.add_node(&node.id, metadata);
        }
        for link in parsed.links {
            graph.add_edge(&link.source, &link.target, RelationType::from(link.relation_type), link.weight);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain() -> Graph {
        let mut g = Graph::new();
        g.add_edge("a", "b", RelationType::depends_on(), 1);
        g.add_edge("b", "c", RelationType::depends_on(), 1);
        g
    }

    #[test]
    fn add_edge_auto_creates_endpoints() {
        let g = sample_chain();
        assert!(g.has_node("a"));
        assert!(g.has_node("b"));
        assert!(g.has_node("c"));
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn remove_node_drops_adjacent_edges() {
        let mut g = sample_chain();
        g.remove_node("b");
        assert!(!g.has_node("b"));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn descendants_and_ancestors_exclude_self() {
        let g = sample_chain();
        let mut descendants = g.descendants("a");
        descendants.sort();
        assert_eq!(descendants, vec!["b", "c"]);
        let mut ancestors = g.ancestors("c");
        ancestors.sort();
        assert_eq!(ancestors, vec!["a", "b"]);
    }

    #[test]
    fn topological_order_fails_on_cycle() {
        let mut g = sample_chain();
        assert!(g.topological_order().is_ok());
        g.add_edge("c", "a", RelationType::depends_on(), 1);
        assert!(matches!(g.topological_order(), Err(GraphError::CyclePresent)));
    }

    #[test]
    fn simple_cycles_finds_the_cycle() {
        let mut g = sample_chain();
        g.add_edge("c", "a", RelationType::depends_on(), 1);
        let cycles = g.simple_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn topological_order_matches_cycle_absence() {
        let g = sample_chain();
        assert!(g.topological_order().is_ok());
        assert!(g.simple_cycles().is_empty());
    }

    #[test]
    fn critical_node_on_a_chain_is_the_middle() {
        let g = sample_chain();
        let critical = g.critical_nodes();
        assert_eq!(critical, vec!["b".to_string()]);
    }

    #[test]
    fn critical_nodes_empty_when_graph_not_connected() {
        let mut g = Graph::new();
        g.add_node("isolated", None);
        g.add_edge("a", "b", RelationType::depends_on(), 1);
        assert!(!g.is_weakly_connected());
        assert!(g.critical_nodes().is_empty());
    }

    #[test]
    fn suggest_scaling_targets_unions_all_three() {
        let g = sample_chain();
        let targets = g.suggest_scaling_targets("b");
        assert_eq!(targets.immediate.len(), 2);
        assert_eq!(targets.descendants, vec!["c".to_string()]);
        assert_eq!(targets.ancestors, vec!["a".to_string()]);
        let mut all = targets.all.clone();
        all.sort();
        assert_eq!(all, vec!["a", "c"]);
    }

    #[test]
    fn export_then_import_round_trips() {
        let g = sample_chain();
        let json = g.export_to_json();
        let imported = Graph::import_from_json(&json).unwrap();
        assert_eq!(imported.node_count(), g.node_count());
        assert_eq!(imported.edge_count(), g.edge_count());
        let mut original_order = g.topological_order().unwrap();
        let mut imported_order = imported.topological_order().unwrap();
        original_order.sort();
        imported_order.sort();
        assert_eq!(original_order, imported_order);
    }

    #[test]
    fn prune_to_removes_non_kept_nodes() {
        let mut g = sample_chain();
        g.prune_to(&["a".to_string(), "b".to_string()]);
        assert!(!g.has_node("c"));
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn edge_looks_up_type_and_weight_by_direction() {
        let g = sample_chain();
        assert_eq!(g.edge("a", "b"), Some((RelationType::depends_on(), 1)));
        assert_eq!(g.edge("b", "a"), None);
    }

    #[test]
    fn remove_edge_reports_existence() {
        let mut g = sample_chain();
        assert!(g.remove_edge("a", "b"));
        assert!(!g.remove_edge("a", "b"));
    }
}
