use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analyzer::blast_radius::RiskLevel;
use crate::error::CoreResult;
use crate::graph::ServiceGraph;
use crate::model::{
    dedupe_evidence, round3, ChangeEvent, ChangeType, EvidenceKind, EvidenceLink,
};
use crate::provenance;
use crate::store::{EventQuery, EventStore};

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_MAX_RESULTS: usize = 20;
pub const DEFAULT_MIN_SCORE: f64 = 0.1;
const EVIDENCE_CAP: usize = 20;

const WEIGHT_TIME: f64 = 0.35;
const WEIGHT_ADJACENCY: f64 = 0.30;
const WEIGHT_RISK: f64 = 0.15;
const WEIGHT_CHANGE_TYPE: f64 = 0.10;
const WEIGHT_ENVIRONMENT: f64 = 0.10;

/// Incident description used to rank candidate changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentQuery {
    pub affected_services: Vec<String>,
    pub incident_time: Option<DateTime<Utc>>,
    pub window_minutes: Option<i64>,
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub incident_environment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceFactors {
    pub time_proximity: f64,
    pub service_adjacency: f64,
    pub change_risk: f64,
    pub change_type: f64,
    pub environment_match: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrelationConfidence {
    pub overall: f64,
    pub factors: ConfidenceFactors,
}

/// One candidate change scored against the incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCorrelation {
    pub change_event: ChangeEvent,
    pub correlation_score: f64,
    pub correlation_reasons: Vec<String>,
    pub why_relevant: Vec<String>,
    pub service_overlap: Vec<String>,
    pub time_delta_minutes: i64,
    pub confidence: CorrelationConfidence,
    pub evidence: Vec<EvidenceLink>,
}

/// Ranks recent change events against an incident using time proximity,
/// graph adjacency, blast-radius risk, change type, and environment.
#[derive(Debug, Clone, Default)]
pub struct ChangeCorrelator;

impl ChangeCorrelator {
    pub fn new() -> Self {
        Self
    }

    pub async fn correlate(
        &self,
        store: &EventStore,
        graph: &ServiceGraph,
        incident: &IncidentQuery,
    ) -> CoreResult<Vec<ChangeCorrelation>> {
        let incident_time = incident.incident_time.unwrap_or_else(Utc::now);
        let window_minutes = incident.window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);
        let min_score = incident.min_score.unwrap_or(DEFAULT_MIN_SCORE);
        let max_results = incident.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        let expanded = expand_services(graph, &incident.affected_services);
        let candidates = if expanded.is_empty() {
            // No services to pivot on: fall back to a plain window query.
            store
                .query(&EventQuery {
                    since: Some(incident_time - chrono::Duration::minutes(window_minutes)),
                    limit: Some(100),
                    ..Default::default()
                })
                .await?
        } else {
            let services: Vec<String> = expanded.keys().cloned().collect();
            store.recent_for_services(&services, window_minutes).await?
        };

        debug!(
            candidates = candidates.len(),
            expanded = expanded.len(),
            "scoring correlation candidates"
        );

        let mut correlations: Vec<ChangeCorrelation> = candidates
            .into_iter()
            .map(|event| {
                score_event(
                    event,
                    &expanded,
                    incident_time,
                    incident.incident_environment.as_deref(),
                )
            })
            .filter(|c| c.correlation_score >= min_score)
            .collect();

        correlations.sort_by(|a, b| {
            b.correlation_score
                .partial_cmp(&a.correlation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        correlations.truncate(max_results);
        Ok(correlations)
    }
}

/// Expands the incident's services through the graph: hop 0 for the named
/// services, hop 1 for immediate up/downstream neighbors, hop 2 for their
/// neighbors. First writer wins, so an explicit direct hit is never demoted.
pub fn expand_services(graph: &ServiceGraph, affected: &[String]) -> HashMap<String, usize> {
    let mut expanded: HashMap<String, usize> = HashMap::new();
    for service in affected {
        expanded.entry(service.clone()).or_insert(0);
    }
    for hop in 1..=2usize {
        let frontier: Vec<String> = expanded
            .iter()
            .filter(|(_, d)| **d == hop - 1)
            .map(|(s, _)| s.clone())
            .collect();
        for service in frontier {
            for neighbor in graph
                .dependents(&service)
                .into_iter()
                .chain(graph.dependencies(&service))
            {
                expanded.entry(neighbor).or_insert(hop);
            }
        }
    }
    expanded
}

fn score_event(
    event: ChangeEvent,
    expanded: &HashMap<String, usize>,
    incident_time: DateTime<Utc>,
    incident_environment: Option<&str>,
) -> ChangeCorrelation {
    let delta_minutes_f = (incident_time - event.timestamp).num_milliseconds().abs() as f64 / 60_000.0;
    let time_proximity = (-delta_minutes_f / 30.0).exp();

    // Best (closest) hop over the event's whole service set.
    let best_hop: Option<usize> = event
        .all_services()
        .iter()
        .filter_map(|s| expanded.get(s).copied())
        .min();
    let service_adjacency = match best_hop {
        Some(0) => 1.0,
        Some(1) => 0.7,
        Some(2) => 0.4,
        _ => 0.0,
    };

    let risk_level = event.blast_radius.as_ref().map(|b| b.risk_level);
    let change_risk = match risk_level {
        Some(RiskLevel::Critical) => 1.0,
        Some(RiskLevel::High) => 0.8,
        Some(RiskLevel::Medium) => 0.5,
        Some(RiskLevel::Low) | None => 0.2,
    };

    let change_type_weight = change_type_weight(event.change_type);

    let environment_match = match incident_environment {
        None => 0.5,
        Some(env) if env == event.environment => 1.0,
        Some(_) => 0.2,
    };

    let score = WEIGHT_TIME * time_proximity
        + WEIGHT_ADJACENCY * service_adjacency
        + WEIGHT_RISK * change_risk
        + WEIGHT_CHANGE_TYPE * change_type_weight
        + WEIGHT_ENVIRONMENT * environment_match;

    let mut reasons: Vec<String> = Vec::new();
    if delta_minutes_f < 15.0 {
        reasons.push("Very recent (<15m)".to_string());
    } else if delta_minutes_f < 60.0 {
        reasons.push("Recent (<60m)".to_string());
    }

    let mut overlap: Vec<String> = Vec::new();
    let mut used_graph_hop = false;
    for service in event.all_services() {
        if let Some(hop) = expanded.get(&service) {
            if !overlap.contains(&service) {
                overlap.push(service.clone());
            }
            match hop {
                0 => reasons.push(format!("Directly affects {}", service)),
                1 => {
                    used_graph_hop = true;
                    reasons.push(format!("1-hop graph neighbor ({})", service));
                }
                _ => {
                    used_graph_hop = true;
                    reasons.push(format!("2-hop graph neighbor ({})", service));
                }
            }
        }
    }

    if change_type_weight >= 0.8 {
        reasons.push(format!("High-impact change type: {}", event.change_type));
    }
    if let Some(level @ (RiskLevel::Critical | RiskLevel::High)) = risk_level {
        reasons.push(format!("Blast radius risk: {}", level));
    }
    if let Some(env) = incident_environment {
        if env == event.environment {
            reasons.push(format!("Environment match ({})", env));
        } else {
            reasons.push(format!(
                "Environment mismatch ({} vs {})",
                event.environment, env
            ));
        }
    }

    let mut evidence = provenance::extract_event_evidence(&event);
    if used_graph_hop {
        evidence.push(EvidenceLink {
            kind: EvidenceKind::GraphPath,
            label: format!(
                "Reached via service graph expansion ({})",
                overlap.join(", ")
            ),
            url: None,
            details: None,
        });
    }
    let evidence = dedupe_evidence(evidence, EVIDENCE_CAP);

    ChangeCorrelation {
        time_delta_minutes: delta_minutes_f.round() as i64,
        change_event: event,
        correlation_score: round3(score),
        correlation_reasons: reasons.clone(),
        why_relevant: reasons,
        service_overlap: overlap,
        confidence: CorrelationConfidence {
            overall: round3(score),
            factors: ConfidenceFactors {
                time_proximity: round3(time_proximity),
                service_adjacency: round3(service_adjacency),
                change_risk: round3(change_risk),
                change_type: round3(change_type_weight),
                environment_match: round3(environment_match),
            },
        },
        evidence,
    }
}

fn change_type_weight(change_type: ChangeType) -> f64 {
    match change_type {
        ChangeType::Deployment => 1.0,
        ChangeType::ConfigChange => 0.9,
        ChangeType::DbMigration => 0.85,
        ChangeType::FeatureFlag => 0.8,
        ChangeType::InfraModification => 0.7,
        ChangeType::CodeChange => 0.65,
        ChangeType::Rollback => 0.6,
        ChangeType::Scaling => 0.5,
        ChangeType::SecurityPatch => 0.4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyEdge;
    use crate::model::{EventStatus, Initiator, NewChangeEvent};

    fn event(service: &str, minutes_ago: i64, change_type: ChangeType) -> ChangeEvent {
        let now = Utc::now();
        let mut event = NewChangeEvent {
            service: Some(service.to_string()),
            summary: Some(format!("change to {}", service)),
            change_type: Some(change_type),
            ..Default::default()
        }
        .into_event(now);
        event.timestamp = now - chrono::Duration::minutes(minutes_ago);
        event
    }

    fn expanded_for(graph: &ServiceGraph, affected: &[&str]) -> HashMap<String, usize> {
        expand_services(
            graph,
            &affected.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn expansion_assigns_hops_and_never_demotes_direct() {
        let mut graph = ServiceGraph::new();
        graph.add_dependency(DependencyEdge::new("a", "b"));
        graph.add_dependency(DependencyEdge::new("b", "c"));
        let expanded = expanded_for(&graph, &["a"]);
        assert_eq!(expanded.get("a"), Some(&0));
        assert_eq!(expanded.get("b"), Some(&1));
        assert_eq!(expanded.get("c"), Some(&2));

        // `b` is both a direct incident service and a's neighbor: stays 0.
        let expanded = expanded_for(&graph, &["a", "b"]);
        assert_eq!(expanded.get("b"), Some(&0));
    }

    #[test]
    fn closer_event_scores_higher() {
        let graph = ServiceGraph::new();
        let expanded = expanded_for(&graph, &["api"]);
        let now = Utc::now();
        let near = score_event(event("api", 5, ChangeType::Deployment), &expanded, now, None);
        let far = score_event(event("api", 90, ChangeType::Deployment), &expanded, now, None);
        assert!(near.correlation_score > far.correlation_score);
        assert!(near.why_relevant.contains(&"Very recent (<15m)".to_string()));
    }

    #[test]
    fn direct_hit_beats_one_hop_beats_two_hop() {
        let mut graph = ServiceGraph::new();
        graph.add_dependency(DependencyEdge::new("a", "b"));
        graph.add_dependency(DependencyEdge::new("b", "c"));
        let expanded = expanded_for(&graph, &["a"]);
        let now = Utc::now();
        let direct = score_event(event("a", 10, ChangeType::Deployment), &expanded, now, None);
        let one_hop = score_event(event("b", 10, ChangeType::Deployment), &expanded, now, None);
        let two_hop = score_event(event("c", 10, ChangeType::Deployment), &expanded, now, None);
        assert!(direct.correlation_score >= one_hop.correlation_score);
        assert!(one_hop.correlation_score >= two_hop.correlation_score);
        assert!(two_hop
            .why_relevant
            .iter()
            .any(|r| r.contains("2-hop graph neighbor")));
        assert_eq!(two_hop.service_overlap, vec!["c"]);
    }

    #[test]
    fn critical_blast_radius_outscores_low() {
        use crate::analyzer::blast_radius::{BlastRadiusPrediction, ConfidenceSummary};
        let graph = ServiceGraph::new();
        let expanded = expanded_for(&graph, &["api"]);
        let now = Utc::now();

        let prediction = |risk| BlastRadiusPrediction {
            direct_services: vec![],
            downstream_services: vec![],
            high_confidence_dependents: vec![],
            possible_dependents: vec![],
            critical_path_affected: false,
            risk_level: risk,
            impact_paths: vec![],
            confidence_summary: ConfidenceSummary::default(),
            evidence: vec![],
            rationale: vec![],
        };

        let mut critical = event("api", 10, ChangeType::Deployment);
        critical.blast_radius = Some(prediction(RiskLevel::Critical));
        let mut low = event("api", 10, ChangeType::Deployment);
        low.blast_radius = Some(prediction(RiskLevel::Low));

        let critical = score_event(critical, &expanded, now, None);
        let low = score_event(low, &expanded, now, None);
        assert!(critical.correlation_score > low.correlation_score);
        assert!(critical
            .why_relevant
            .iter()
            .any(|r| r.contains("Blast radius risk: critical")));
    }

    #[test]
    fn environment_factor_uses_half_weight_when_unspecified() {
        let graph = ServiceGraph::new();
        let expanded = expanded_for(&graph, &["api"]);
        let now = Utc::now();
        let unspecified =
            score_event(event("api", 10, ChangeType::Deployment), &expanded, now, None);
        assert_eq!(unspecified.confidence.factors.environment_match, 0.5);

        let matched = score_event(
            event("api", 10, ChangeType::Deployment),
            &expanded,
            now,
            Some("production"),
        );
        assert_eq!(matched.confidence.factors.environment_match, 1.0);

        let mismatched = score_event(
            event("api", 10, ChangeType::Deployment),
            &expanded,
            now,
            Some("staging"),
        );
        assert_eq!(mismatched.confidence.factors.environment_match, 0.2);
        assert!(mismatched
            .why_relevant
            .iter()
            .any(|r| r.contains("Environment mismatch")));
    }

    #[test]
    fn scores_and_factors_are_rounded_to_three_decimals() {
        let graph = ServiceGraph::new();
        let expanded = expanded_for(&graph, &["api"]);
        let scored = score_event(
            event("api", 7, ChangeType::CodeChange),
            &expanded,
            Utc::now(),
            None,
        );
        let assert_rounded = |v: f64| {
            assert!((v * 1000.0 - (v * 1000.0).round()).abs() < 1e-9, "{}", v);
        };
        assert_rounded(scored.correlation_score);
        assert_rounded(scored.confidence.factors.time_proximity);
        assert_rounded(scored.confidence.overall);
    }

    #[test]
    fn initiator_and_status_defaults_do_not_break_scoring() {
        let graph = ServiceGraph::new();
        let expanded = expanded_for(&graph, &["api"]);
        let scored = score_event(
            event("api", 0, ChangeType::SecurityPatch),
            &expanded,
            Utc::now(),
            None,
        );
        assert_eq!(scored.change_event.initiator, Initiator::Unknown);
        assert_eq!(scored.change_event.status, EventStatus::Completed);
        assert!(scored.correlation_score > 0.0);
    }
}
