use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::graph::{Criticality, EdgeSourceTag, ImpactPath, ServiceGraph};
use crate::model::{dedupe_evidence, ChangeType, EvidenceKind, EvidenceLink};

pub const DEFAULT_MAX_DEPTH: usize = 3;
const EVIDENCE_CAP: usize = 40;

/// Direct dependents sit one edge away; the path includes the source node,
/// so a single-edge path has two entries.
const DIRECT_HOPS: usize = 2;

const HIGH_CONFIDENCE_FLOOR: f64 = 0.75;
const INFERRED_TRUST_FLOOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceSummary {
    pub high_confidence_count: usize,
    pub possible_count: usize,
    /// Lowest aggregated confidence across all impact paths, 1.0 when none.
    pub min_path_confidence: f64,
    pub inferred_edges_present: bool,
}

/// Predicted consumer-side impact of changing or breaking a set of services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlastRadiusPrediction {
    pub direct_services: Vec<String>,
    pub downstream_services: Vec<String>,
    pub high_confidence_dependents: Vec<String>,
    pub possible_dependents: Vec<String>,
    pub critical_path_affected: bool,
    pub risk_level: RiskLevel,
    pub impact_paths: Vec<ImpactPath>,
    pub confidence_summary: ConfidenceSummary,
    pub evidence: Vec<EvidenceLink>,
    pub rationale: Vec<String>,
}

/// Walks the dependency graph upstream from target services and classifies
/// the affected consumers.
#[derive(Debug, Clone)]
pub struct BlastRadiusAnalyzer {
    max_depth: usize,
}

impl Default for BlastRadiusAnalyzer {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl BlastRadiusAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn predict(
        &self,
        graph: &ServiceGraph,
        targets: &[String],
        change_type: Option<ChangeType>,
    ) -> BlastRadiusPrediction {
        self.predict_with_depth(graph, targets, change_type, self.max_depth)
    }

    pub fn predict_with_depth(
        &self,
        graph: &ServiceGraph,
        targets: &[String],
        change_type: Option<ChangeType>,
        max_depth: usize,
    ) -> BlastRadiusPrediction {
        let mut all_paths: Vec<ImpactPath> = Vec::new();
        for target in targets {
            all_paths.extend(graph.upstream_impact(target, max_depth));
        }
        all_paths.sort_by(|a, b| a.hops.cmp(&b.hops));

        let target_set: BTreeSet<&str> = targets.iter().map(String::as_str).collect();

        // Per affected node, keep whether any path reaches it directly and
        // whether any path supports high confidence.
        let mut direct: BTreeSet<String> = BTreeSet::new();
        let mut downstream: BTreeSet<String> = BTreeSet::new();
        let mut high_confidence: BTreeSet<String> = BTreeSet::new();
        let mut reached: HashMap<String, bool> = HashMap::new();
        let mut critical_path_affected = false;
        let mut min_path_confidence = 1.0f64;
        let mut inferred_edges_present = false;

        for path in &all_paths {
            if target_set.contains(path.affected.as_str()) {
                continue;
            }
            if path.hops <= DIRECT_HOPS {
                direct.insert(path.affected.clone());
            } else {
                downstream.insert(path.affected.clone());
            }
            if path.criticality == Criticality::Critical {
                critical_path_affected = true;
            }
            min_path_confidence = min_path_confidence.min(path.confidence);
            if path.edge_sources.contains(&EdgeSourceTag::Inferred) {
                inferred_edges_present = true;
            }

            let trusted = path.confidence >= HIGH_CONFIDENCE_FLOOR
                && !path_has_weak_inferred_edge(graph, &path.path);
            let entry = reached.entry(path.affected.clone()).or_insert(false);
            *entry = *entry || trusted;
        }

        // No double counting: a direct dependent never also appears
        // downstream.
        for service in &direct {
            downstream.remove(service);
        }
        for (service, trusted) in &reached {
            if *trusted {
                high_confidence.insert(service.clone());
            }
        }
        let possible: BTreeSet<String> = reached
            .keys()
            .filter(|s| !high_confidence.contains(*s))
            .cloned()
            .collect();

        let evidence = dedupe_evidence(
            all_paths
                .iter()
                .filter(|p| !target_set.contains(p.affected.as_str()))
                .map(path_evidence)
                .collect(),
            EVIDENCE_CAP,
        );

        let direct_count = direct.len();
        let downstream_count = downstream.len();
        let risk_level = classify_risk(
            critical_path_affected,
            direct_count,
            downstream_count,
            change_type,
        );

        let rationale = build_rationale(
            targets,
            direct_count,
            downstream_count,
            high_confidence.len(),
            critical_path_affected,
            change_type,
            risk_level,
        );

        debug!(
            targets = targets.len(),
            direct = direct_count,
            downstream = downstream_count,
            risk = %risk_level,
            "computed blast radius"
        );

        BlastRadiusPrediction {
            direct_services: direct.into_iter().collect(),
            downstream_services: downstream.into_iter().collect(),
            high_confidence_dependents: high_confidence.into_iter().collect(),
            possible_dependents: possible.into_iter().collect(),
            critical_path_affected,
            risk_level,
            impact_paths: all_paths,
            confidence_summary: ConfidenceSummary {
                high_confidence_count: reached.values().filter(|t| **t).count(),
                possible_count: reached.values().filter(|t| !**t).count(),
                min_path_confidence,
                inferred_edges_present,
            },
            evidence,
            rationale,
        }
    }
}

/// True when any edge along the walk is `inferred` with a confidence below
/// the trust floor. Upstream paths run consumer-ward, so the edge between
/// `path[i]` and `path[i+1]` is `path[i+1] -> path[i]`.
fn path_has_weak_inferred_edge(graph: &ServiceGraph, path: &[String]) -> bool {
    path.windows(2).any(|pair| {
        graph
            .get_edge(&pair[1], &pair[0])
            .map(|edge| {
                edge.provenance() == EdgeSourceTag::Inferred
                    && edge.confidence < INFERRED_TRUST_FLOOR
            })
            .unwrap_or(false)
    })
}

fn path_evidence(path: &ImpactPath) -> EvidenceLink {
    EvidenceLink {
        kind: EvidenceKind::GraphPath,
        label: format!("Impact path {}", path.path.join(" -> ")),
        url: None,
        details: Some(json!({
            "from": path.source,
            "to": path.affected,
            "hops": path.path.len().saturating_sub(1),
            "criticality": path.criticality,
            "confidence": path.confidence,
            "edge_sources": path.edge_sources,
        })),
    }
}

fn classify_risk(
    critical_path_affected: bool,
    direct_count: usize,
    downstream_count: usize,
    change_type: Option<ChangeType>,
) -> RiskLevel {
    if critical_path_affected {
        return RiskLevel::Critical;
    }
    if downstream_count > 10 || direct_count > 3 {
        return RiskLevel::High;
    }
    if downstream_count > 3
        || direct_count > 1
        || (change_type == Some(ChangeType::DbMigration) && direct_count > 0)
    {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

fn build_rationale(
    targets: &[String],
    direct_count: usize,
    downstream_count: usize,
    high_confidence_count: usize,
    critical_path_affected: bool,
    change_type: Option<ChangeType>,
    risk_level: RiskLevel,
) -> Vec<String> {
    let mut rationale = vec![format!("Analyzed targets: {}", targets.join(", "))];
    rationale.push(format!("{} direct dependents found", direct_count));
    rationale.push(format!(
        "{} downstream services reachable within the depth limit",
        downstream_count
    ));
    rationale.push(format!(
        "{} dependents classified high-confidence",
        high_confidence_count
    ));
    if critical_path_affected {
        rationale.push("At least one impact path is critical end-to-end".to_string());
    }
    if let Some(ct) = change_type {
        rationale.push(format!("Change type under analysis: {}", ct));
    }
    if direct_count == 0 && downstream_count == 0 {
        rationale.push("No dependents found; the targets appear isolated".to_string());
    }
    rationale.push(format!("Risk level: {}", risk_level));
    rationale
}
