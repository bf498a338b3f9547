use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Service,
    Database,
    Cache,
    Queue,
    External,
    Infrastructure,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::Service
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Sync,
    Async,
    Database,
    Cache,
    Queue,
    External,
}

impl Default for EdgeType {
    fn default() -> Self {
        EdgeType::Sync
    }
}

/// How load-bearing a dependency edge is for its consumer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    Degraded,
    Optional,
}

impl Default for Criticality {
    fn default() -> Self {
        Criticality::Critical
    }
}

impl Criticality {
    fn rank(self) -> u8 {
        match self {
            Criticality::Critical => 0,
            Criticality::Degraded => 1,
            Criticality::Optional => 2,
        }
    }

    /// Weakest-link aggregation: a path is only as strong as its most
    /// permissive edge, so the aggregate moves toward the weaker value.
    pub fn weaker(self, other: Criticality) -> Criticality {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::Degraded => "degraded",
            Criticality::Optional => "optional",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance layer an edge came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSourceTag {
    Config,
    Manual,
    Backstage,
    Otel,
    #[serde(rename = "kube-labels")]
    KubeLabels,
    Inferred,
    Discovered,
    Import,
    #[serde(rename = "mcp-import")]
    McpImport,
}

impl EdgeSourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeSourceTag::Config => "config",
            EdgeSourceTag::Manual => "manual",
            EdgeSourceTag::Backstage => "backstage",
            EdgeSourceTag::Otel => "otel",
            EdgeSourceTag::KubeLabels => "kube-labels",
            EdgeSourceTag::Inferred => "inferred",
            EdgeSourceTag::Discovered => "discovered",
            EdgeSourceTag::Import => "import",
            EdgeSourceTag::McpImport => "mcp-import",
        }
    }
}

impl fmt::Display for EdgeSourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeSourceTag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(EdgeSourceTag::Config),
            "manual" => Ok(EdgeSourceTag::Manual),
            "backstage" => Ok(EdgeSourceTag::Backstage),
            "otel" => Ok(EdgeSourceTag::Otel),
            "kube-labels" => Ok(EdgeSourceTag::KubeLabels),
            "inferred" => Ok(EdgeSourceTag::Inferred),
            "discovered" => Ok(EdgeSourceTag::Discovered),
            "import" => Ok(EdgeSourceTag::Import),
            "mcp-import" => Ok(EdgeSourceTag::McpImport),
            _ => Err(CoreError::validation(format!("unknown edge source: {}", s))),
        }
    }
}

/// Participant in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub tier: Option<ServiceTier>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ServiceNode {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type: NodeType::Service,
            tier: None,
            team: None,
            owner: None,
            repository: None,
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }
}

fn default_confidence() -> f64 {
    1.0
}

/// Directed dependency: `source` depends on `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default)]
    pub edge_source: Option<EdgeSourceTag>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DependencyEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: edge_id(&source, &target),
            source,
            target,
            edge_type: EdgeType::Sync,
            protocol: None,
            criticality: Criticality::Critical,
            edge_source: None,
            confidence: 1.0,
            last_seen: None,
            description: None,
            metadata: Map::new(),
        }
    }

    pub fn provenance(&self) -> EdgeSourceTag {
        self.edge_source.unwrap_or(EdgeSourceTag::Manual)
    }
}

/// Canonical edge id. One edge per ordered pair; reinsertion overwrites.
pub fn edge_id(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}

/// One walk from a traversal origin to an affected node, with aggregated
/// attributes over the edges visited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactPath {
    pub source: String,
    pub affected: String,
    pub path: Vec<String>,
    pub hops: usize,
    pub criticality: Criticality,
    pub confidence: f64,
    pub edge_sources: Vec<EdgeSourceTag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_team: BTreeMap<String, usize>,
    pub avg_out_degree: f64,
    pub critical_services: usize,
}

/// JSON wire shape for export/import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<DependencyEdge>,
}

/// YAML bootstrap file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub services: Vec<ServiceNode>,
    pub dependencies: Vec<DependencyEdge>,
}

/// Typed directed multigraph of services and their dependencies, with
/// adjacency indexes in both directions.
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    nodes: HashMap<String, ServiceNode>,
    edges: HashMap<String, DependencyEdge>,
    outgoing: HashMap<String, HashSet<String>>,
    incoming: HashMap<String, HashSet<String>>,
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn get_service(&self, id: &str) -> Option<&ServiceNode> {
        self.nodes.get(id)
    }

    pub fn has_service(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn services(&self) -> Vec<&ServiceNode> {
        let mut nodes: Vec<&ServiceNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Idempotent by id; reinsertion overwrites the node's attributes.
    pub fn add_service(&mut self, mut node: ServiceNode) {
        if node.name.trim().is_empty() {
            node.name = node.id.clone();
        }
        self.outgoing.entry(node.id.clone()).or_default();
        self.incoming.entry(node.id.clone()).or_default();
        self.nodes.insert(node.id.clone(), node);
    }

    /// Adds (or overwrites) the single edge for the ordered pair
    /// (source, target). Confidence is clamped into [0,1]; the provenance
    /// tag falls back to `metadata.source` when not explicit.
    pub fn add_dependency(&mut self, mut edge: DependencyEdge) {
        edge.id = edge_id(&edge.source, &edge.target);
        edge.confidence = edge.confidence.clamp(0.0, 1.0);
        if edge.edge_source.is_none() {
            edge.edge_source = edge
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());
        }
        if edge.edge_source.is_none() {
            edge.edge_source = Some(EdgeSourceTag::Manual);
        }
        if edge.last_seen.is_none() {
            edge.last_seen = Some(Utc::now());
        }

        if !self.nodes.contains_key(&edge.source) {
            self.add_service(ServiceNode::new(edge.source.clone()));
        }
        if !self.nodes.contains_key(&edge.target) {
            self.add_service(ServiceNode::new(edge.target.clone()));
        }

        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .insert(edge.target.clone());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .insert(edge.source.clone());
        self.edges.insert(edge.id.clone(), edge);
    }

    /// Removes the node and every incident edge from both adjacency indexes.
    pub fn remove_service(&mut self, id: &str) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        let out: Vec<String> = self.outgoing.remove(id).unwrap_or_default().into_iter().collect();
        for target in out {
            self.edges.remove(&edge_id(id, &target));
            if let Some(sources) = self.incoming.get_mut(&target) {
                sources.remove(id);
            }
        }
        let inc: Vec<String> = self.incoming.remove(id).unwrap_or_default().into_iter().collect();
        for source in inc {
            self.edges.remove(&edge_id(&source, id));
            if let Some(targets) = self.outgoing.get_mut(&source) {
                targets.remove(id);
            }
        }
        true
    }

    pub fn remove_dependency(&mut self, source: &str, target: &str) -> bool {
        if self.edges.remove(&edge_id(source, target)).is_none() {
            return false;
        }
        if let Some(targets) = self.outgoing.get_mut(source) {
            targets.remove(target);
        }
        if let Some(sources) = self.incoming.get_mut(target) {
            sources.remove(source);
        }
        true
    }

    pub fn get_edge(&self, source: &str, target: &str) -> Option<&DependencyEdge> {
        self.edges.get(&edge_id(source, target))
    }

    /// Outgoing neighbors: the services `id` depends on.
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .outgoing
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Incoming neighbors: the services that depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .incoming
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn outgoing_edges(&self, id: &str) -> Vec<&DependencyEdge> {
        let mut edges: Vec<&DependencyEdge> = self
            .outgoing
            .get(id)
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(|t| self.edges.get(&edge_id(id, t)))
                    .collect()
            })
            .unwrap_or_default();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub fn incoming_edges(&self, id: &str) -> Vec<&DependencyEdge> {
        let mut edges: Vec<&DependencyEdge> = self
            .incoming
            .get(id)
            .map(|sources| {
                sources
                    .iter()
                    .filter_map(|s| self.edges.get(&edge_id(s, id)))
                    .collect()
            })
            .unwrap_or_default();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    /// BFS over outgoing edges; first path found is shortest by edge count.
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_string());
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![from.to_string()]);

        while let Some(path) = queue.pop_front() {
            let last = path.last().expect("queued paths are non-empty");
            for target in self.dependencies(last) {
                if target == to {
                    let mut found = path.clone();
                    found.push(target);
                    return Some(found);
                }
                if visited.insert(target.clone()) {
                    let mut next = path.clone();
                    next.push(target);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Who is affected when `id` breaks: bounded DFS over incoming edges
    /// (consumers). See [`ImpactPath`] for the aggregation rules.
    pub fn upstream_impact(&self, id: &str, max_depth: usize) -> Vec<ImpactPath> {
        self.impact(id, max_depth, Direction::Upstream)
    }

    /// What `id` relies on: bounded DFS over outgoing edges (providers).
    pub fn downstream_impact(&self, id: &str, max_depth: usize) -> Vec<ImpactPath> {
        self.impact(id, max_depth, Direction::Downstream)
    }

    fn impact(&self, id: &str, max_depth: usize, direction: Direction) -> Vec<ImpactPath> {
        if !self.nodes.contains_key(id) {
            return Vec::new();
        }
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(id.to_string());
        let mut results = Vec::new();
        let mut path = vec![id.to_string()];
        self.visit(
            id,
            0,
            max_depth,
            direction,
            &mut visited,
            &mut path,
            Criticality::Critical,
            1.0,
            &Vec::new(),
            &mut results,
        );
        results.sort_by(|a, b| a.hops.cmp(&b.hops));
        results
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        node: &str,
        depth: usize,
        max_depth: usize,
        direction: Direction,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        criticality: Criticality,
        confidence: f64,
        edge_sources: &Vec<EdgeSourceTag>,
        results: &mut Vec<ImpactPath>,
    ) {
        if depth >= max_depth {
            return;
        }
        let edges = match direction {
            Direction::Upstream => self.incoming_edges(node),
            Direction::Downstream => self.outgoing_edges(node),
        };
        for edge in edges {
            let neighbor = match direction {
                Direction::Upstream => edge.source.clone(),
                Direction::Downstream => edge.target.clone(),
            };
            if !visited.insert(neighbor.clone()) {
                continue;
            }
            let agg_criticality = criticality.weaker(edge.criticality);
            let agg_confidence = confidence.min(edge.confidence);
            let mut sources = edge_sources.clone();
            let tag = edge.provenance();
            if !sources.contains(&tag) {
                sources.push(tag);
            }
            path.push(neighbor.clone());
            results.push(ImpactPath {
                source: path[0].clone(),
                affected: neighbor.clone(),
                path: path.clone(),
                hops: path.len(),
                criticality: agg_criticality,
                confidence: agg_confidence,
                edge_sources: sources.clone(),
            });
            self.visit(
                &neighbor,
                depth + 1,
                max_depth,
                direction,
                visited,
                path,
                agg_criticality,
                agg_confidence,
                &sources,
                results,
            );
            path.pop();
        }
    }

    /// Layered population: nodes and edges already in `self` win; only
    /// missing ones are taken from `incoming`, nodes stamped with the
    /// provenance tag. Topology-commutative.
    pub fn merge(&mut self, incoming: &ServiceGraph, provenance: &str) {
        let mut added_nodes = 0usize;
        let mut added_edges = 0usize;
        for node in incoming.services() {
            if !self.nodes.contains_key(&node.id) {
                let mut node = node.clone();
                node.metadata
                    .insert("source".to_string(), Value::String(provenance.to_string()));
                self.add_service(node);
                added_nodes += 1;
            }
        }
        let mut edges: Vec<&DependencyEdge> = incoming.edges.values().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        for edge in edges {
            if !self.edges.contains_key(&edge.id) {
                let mut edge = edge.clone();
                if edge.edge_source.is_none() {
                    edge.edge_source = provenance.parse().ok().or(Some(EdgeSourceTag::Import));
                }
                self.add_dependency(edge);
                added_edges += 1;
            }
        }
        debug!(
            provenance,
            added_nodes, added_edges, "merged graph layer"
        );
    }

    pub fn stats(&self) -> GraphStats {
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_team: BTreeMap<String, usize> = BTreeMap::new();
        let mut critical_services = 0usize;
        for node in self.nodes.values() {
            let type_key = serde_json::to_value(node.node_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "service".to_string());
            *by_type.entry(type_key).or_default() += 1;
            if let Some(team) = &node.team {
                *by_team.entry(team.clone()).or_default() += 1;
            }
            if node.tier == Some(ServiceTier::Critical) {
                critical_services += 1;
            }
        }
        let avg_out_degree = if self.nodes.is_empty() {
            0.0
        } else {
            self.edges.len() as f64 / self.nodes.len() as f64
        };
        GraphStats {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            by_type,
            by_team,
            avg_out_degree,
            critical_services,
        }
    }

    pub fn to_export(&self) -> GraphExport {
        let mut nodes: Vec<ServiceNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<DependencyEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        GraphExport { nodes, edges }
    }

    pub fn from_export(export: GraphExport) -> Self {
        let mut graph = ServiceGraph::new();
        for node in export.nodes {
            graph.add_service(node);
        }
        for edge in export.edges {
            graph.add_dependency(edge);
        }
        graph
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(&self.to_export())
            .map_err(|e| CoreError::invariant(format!("graph serialization failed: {}", e)))
    }

    pub fn from_json(raw: &str) -> CoreResult<Self> {
        let export: GraphExport = serde_json::from_str(raw)
            .map_err(|e| CoreError::validation(format!("invalid graph JSON: {}", e)))?;
        Ok(Self::from_export(export))
    }

    pub fn from_config(config: GraphConfig) -> Self {
        let mut graph = ServiceGraph::new();
        for mut node in config.services {
            if node.metadata.get("source").is_none() {
                node.metadata
                    .insert("source".to_string(), Value::String("config".to_string()));
            }
            graph.add_service(node);
        }
        for mut edge in config.dependencies {
            if edge.edge_source.is_none() {
                edge.edge_source = Some(EdgeSourceTag::Config);
            }
            graph.add_dependency(edge);
        }
        graph
    }

    pub fn from_yaml(raw: &str) -> CoreResult<Self> {
        let config: GraphConfig = serde_yaml::from_str(raw)
            .map_err(|e| CoreError::validation(format!("invalid graph YAML: {}", e)))?;
        Ok(Self::from_config(config))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}
