use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::blast_radius::{BlastRadiusAnalyzer, BlastRadiusPrediction};
use crate::analyzer::correlation::{
    ChangeCorrelation, ConfidenceFactors, CorrelationConfidence,
};
use crate::graph::ServiceGraph;
use crate::model::{
    dedupe_evidence, round3, AuthorType, ChangeEvent, ChangeType, EvidenceLink, Initiator,
};
use crate::provenance;

pub const DEFAULT_BUCKET_MINUTES: i64 = 15;
pub const DEFAULT_TRIAGE_RESULTS: usize = 3;
pub const DEFAULT_CORRELATE_RESULTS: usize = 5;
const EVIDENCE_CAP: usize = 25;
const WHY_RELEVANT_CAP: usize = 10;

/// Metadata keys that identify a shared run, in priority order.
const RUN_ID_KEYS: [&str; 7] = [
    "pipeline_id",
    "pipeline_run_id",
    "workflow_run_id",
    "run_id",
    "deployment_id",
    "session_id",
    "parent_event_id",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Updated,
    Missing,
    Unknown,
}

/// Whether a change set ships the operational artifacts needed to respond
/// to its own fallout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessDelta {
    pub runbook_updated: ReadinessState,
    pub monitoring_updated: ReadinessState,
    pub ownership_known: ReadinessState,
    pub notes: Vec<String>,
}

/// A cluster of related events representing one logical release, run, or
/// working session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub key: String,
    pub title: String,
    pub event_count: usize,
    pub event_ids: Vec<String>,
    pub events: Vec<ChangeEvent>,
    pub services: Vec<String>,
    pub repositories: Vec<String>,
    pub environment: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub change_types: Vec<ChangeType>,
    pub initiators: Vec<Initiator>,
    pub author_types: Vec<AuthorType>,
    pub evidence: Vec<EvidenceLink>,
    pub readiness_delta: ReadinessDelta,
    pub confidence: f64,
}

/// A change set scored against an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChangeSet {
    pub change_set: ChangeSet,
    pub score: f64,
    pub why_relevant: Vec<String>,
    pub confidence: CorrelationConfidence,
    pub suggested_blast_radius: BlastRadiusPrediction,
}

/// Groups events into logical change sets for triage summarization.
#[derive(Debug, Clone)]
pub struct ChangeSetGrouper {
    bucket_minutes: i64,
}

impl Default for ChangeSetGrouper {
    fn default() -> Self {
        Self {
            bucket_minutes: DEFAULT_BUCKET_MINUTES,
        }
    }
}

struct GroupKey {
    key: String,
    title: String,
    confidence: f64,
}

impl ChangeSetGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket_minutes(bucket_minutes: i64) -> Self {
        Self { bucket_minutes }
    }

    /// Clusters events by derived key, preserving first-seen group order.
    pub fn group(&self, events: &[ChangeEvent], graph: Option<&ServiceGraph>) -> Vec<ChangeSet> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (GroupKey, Vec<ChangeEvent>)> = HashMap::new();

        for event in events {
            let group_key = self.derive_key(event);
            match groups.get_mut(&group_key.key) {
                Some((_, members)) => members.push(event.clone()),
                None => {
                    order.push(group_key.key.clone());
                    groups.insert(group_key.key.clone(), (group_key, vec![event.clone()]));
                }
            }
        }

        debug!(events = events.len(), groups = order.len(), "grouped change sets");

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .map(|(group_key, members)| assemble_change_set(group_key, members, graph))
            .collect()
    }

    /// Groups correlated events and scores each group against the incident.
    pub fn rank_for_incident(
        &self,
        correlations: &[ChangeCorrelation],
        graph: &ServiceGraph,
        analyzer: &BlastRadiusAnalyzer,
        max_results: Option<usize>,
    ) -> Vec<RankedChangeSet> {
        let max_results = max_results.unwrap_or(DEFAULT_TRIAGE_RESULTS);
        let events: Vec<ChangeEvent> = correlations
            .iter()
            .map(|c| c.change_event.clone())
            .collect();
        let by_event: HashMap<&str, &ChangeCorrelation> = correlations
            .iter()
            .map(|c| (c.change_event.id.as_str(), c))
            .collect();

        let mut ranked: Vec<RankedChangeSet> = self
            .group(&events, Some(graph))
            .into_iter()
            .map(|change_set| {
                let children: Vec<&ChangeCorrelation> = change_set
                    .event_ids
                    .iter()
                    .filter_map(|id| by_event.get(id.as_str()).copied())
                    .collect();
                score_group(change_set, &children, graph, analyzer)
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(max_results);
        ranked
    }

    /// First matching rule wins; higher-priority keys carry higher
    /// grouping confidence.
    fn derive_key(&self, event: &ChangeEvent) -> GroupKey {
        if let Some(explicit) = &event.change_set_id {
            return GroupKey {
                key: format!("explicit:{}", explicit),
                title: format!("Change set {}", explicit),
                confidence: 1.0,
            };
        }

        for key in RUN_ID_KEYS {
            if let Some(value) = event.metadata_str(key) {
                return GroupKey {
                    key: format!("run:{}:{}", event.source, value),
                    title: format!("Run {} ({})", value, event.source),
                    confidence: 0.92,
                };
            }
        }

        if let (Some(repository), Some(pr_number)) = (&event.repository, event.pr_number) {
            return GroupKey {
                key: format!("pr:{}:{}", repository, pr_number),
                title: format!("PR #{} in {}", pr_number, repository),
                confidence: 0.90,
            };
        }

        if let (Some(repository), Some(sha)) = (&event.repository, &event.commit_sha) {
            return GroupKey {
                key: format!("commit:{}:{}", repository, sha),
                title: format!("Commit {} in {}", &sha[..sha.len().min(7)], repository),
                confidence: 0.86,
            };
        }

        let scope = event
            .repository
            .clone()
            .unwrap_or_else(|| event.service.clone());
        let bucket = event.timestamp.timestamp().div_euclid(self.bucket_minutes * 60);
        GroupKey {
            key: format!("bucket:{}:{}:{}", event.environment, scope, bucket),
            title: format!("Changes to {} ({})", scope, event.environment),
            confidence: 0.62,
        }
    }
}

fn assemble_change_set(
    group_key: GroupKey,
    mut events: Vec<ChangeEvent>,
    graph: Option<&ServiceGraph>,
) -> ChangeSet {
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut services: BTreeSet<String> = BTreeSet::new();
    let mut repositories: BTreeSet<String> = BTreeSet::new();
    let mut change_types: BTreeSet<ChangeType> = BTreeSet::new();
    let mut initiators: BTreeSet<Initiator> = BTreeSet::new();
    let mut author_types: BTreeSet<AuthorType> = BTreeSet::new();
    let mut environments: BTreeSet<String> = BTreeSet::new();
    let mut files: Vec<String> = Vec::new();
    let mut evidence: Vec<EvidenceLink> = Vec::new();

    for event in &events {
        services.extend(event.all_services());
        if let Some(repository) = &event.repository {
            repositories.insert(repository.clone());
        }
        change_types.insert(event.change_type);
        initiators.insert(event.initiator);
        if let Some(author_type) = event.author_type {
            author_types.insert(author_type);
        }
        environments.insert(event.environment.clone());
        files.extend(event.files_changed.iter().cloned());
        evidence.extend(provenance::extract_event_evidence(event));
    }

    let environment = if environments.len() == 1 {
        environments.into_iter().next().unwrap_or_default()
    } else {
        "mixed".to_string()
    };

    let services: Vec<String> = services.into_iter().collect();
    let readiness_delta = compute_readiness(&files, &services, graph);

    let window_start = events
        .first()
        .map(|e| e.timestamp)
        .unwrap_or_else(Utc::now);
    let window_end = events.last().map(|e| e.timestamp).unwrap_or(window_start);

    ChangeSet {
        id: Uuid::new_v4().to_string(),
        key: group_key.key,
        title: group_key.title,
        event_count: events.len(),
        event_ids: events.iter().map(|e| e.id.clone()).collect(),
        services,
        repositories: repositories.into_iter().collect(),
        environment,
        window_start,
        window_end,
        change_types: change_types.into_iter().collect(),
        initiators: initiators.into_iter().collect(),
        author_types: author_types.into_iter().collect(),
        evidence: dedupe_evidence(evidence, EVIDENCE_CAP),
        readiness_delta,
        confidence: group_key.confidence,
        events,
    }
}

fn runbook_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"runbook|playbook|docs/runbooks?|oncall")
            .case_insensitive(true)
            .build()
            .expect("static pattern")
    })
}

fn monitoring_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"alert|monitor|grafana|dashboard|prometheus|sli|slo")
            .case_insensitive(true)
            .build()
            .expect("static pattern")
    })
}

fn file_signal(files: &[String], pattern: &Regex) -> ReadinessState {
    if files.is_empty() {
        ReadinessState::Unknown
    } else if files.iter().any(|f| pattern.is_match(f)) {
        ReadinessState::Updated
    } else {
        ReadinessState::Missing
    }
}

fn compute_readiness(
    files: &[String],
    services: &[String],
    graph: Option<&ServiceGraph>,
) -> ReadinessDelta {
    let runbook_updated = file_signal(files, runbook_regex());
    let monitoring_updated = file_signal(files, monitoring_regex());

    let (ownership_known, unowned): (ReadinessState, Vec<String>) = if services.is_empty() {
        (ReadinessState::Unknown, Vec::new())
    } else {
        let unowned: Vec<String> = services
            .iter()
            .filter(|id| {
                graph
                    .and_then(|g| g.get_service(id))
                    .map(|node| node.team.is_none() && node.owner.is_none())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if unowned.is_empty() {
            (ReadinessState::Updated, unowned)
        } else {
            (ReadinessState::Missing, unowned)
        }
    };

    let mut notes = Vec::new();
    if runbook_updated == ReadinessState::Missing {
        notes.push("No runbook updates in this change set".to_string());
    }
    if monitoring_updated == ReadinessState::Missing {
        notes.push("No monitoring updates in this change set".to_string());
    }
    if ownership_known == ReadinessState::Missing {
        notes.push(format!("Ownership unknown for: {}", unowned.join(", ")));
    }

    ReadinessDelta {
        runbook_updated,
        monitoring_updated,
        ownership_known,
        notes,
    }
}

fn score_group(
    change_set: ChangeSet,
    children: &[&ChangeCorrelation],
    graph: &ServiceGraph,
    analyzer: &BlastRadiusAnalyzer,
) -> RankedChangeSet {
    let scores: Vec<f64> = children.iter().map(|c| c.correlation_score).collect();
    let max_score = scores.iter().cloned().fold(0.0f64, f64::max);
    let avg_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };
    let score = round3(0.65 * max_score + 0.35 * avg_score);

    let mut why_relevant: Vec<String> = Vec::new();
    for child in children {
        for reason in &child.why_relevant {
            if !why_relevant.contains(reason) {
                why_relevant.push(reason.clone());
            }
        }
    }
    for note in &change_set.readiness_delta.notes {
        if !why_relevant.contains(note) {
            why_relevant.push(note.clone());
        }
    }
    why_relevant.truncate(WHY_RELEVANT_CAP);

    let factor_mean = |f: fn(&ConfidenceFactors) -> f64| {
        if children.is_empty() {
            0.0
        } else {
            round3(
                children
                    .iter()
                    .map(|c| f(&c.confidence.factors))
                    .sum::<f64>()
                    / children.len() as f64,
            )
        }
    };
    let confidence = CorrelationConfidence {
        overall: score,
        factors: ConfidenceFactors {
            time_proximity: factor_mean(|f| f.time_proximity),
            service_adjacency: factor_mean(|f| f.service_adjacency),
            change_risk: factor_mean(|f| f.change_risk),
            change_type: factor_mean(|f| f.change_type),
            environment_match: factor_mean(|f| f.environment_match),
        },
    };

    let dominant_change_type = dominant_change_type(&change_set.events);
    let suggested_blast_radius =
        analyzer.predict(graph, &change_set.services, dominant_change_type);

    RankedChangeSet {
        change_set,
        score,
        why_relevant,
        confidence,
        suggested_blast_radius,
    }
}

fn dominant_change_type(events: &[ChangeEvent]) -> Option<ChangeType> {
    let mut counts: BTreeMap<ChangeType, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.change_type).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(change_type, _)| change_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ServiceNode;
    use crate::model::NewChangeEvent;
    use serde_json::Value;

    fn event(service: &str, minutes_ago: i64) -> ChangeEvent {
        let now = Utc::now();
        let mut event = NewChangeEvent {
            service: Some(service.to_string()),
            summary: Some(format!("change {}", service)),
            change_type: Some(ChangeType::Deployment),
            ..Default::default()
        }
        .into_event(now);
        event.timestamp = now - chrono::Duration::minutes(minutes_ago);
        event
    }

    #[test]
    fn pipeline_id_groups_across_services() {
        let grouper = ChangeSetGrouper::new();
        let mut events = vec![event("api", 4), event("worker", 2), event("db", 1)];
        for e in &mut events {
            e.source = crate::model::EventSource::Github;
            e.metadata
                .insert("pipeline_id".into(), Value::String("p-42".into()));
        }
        let sets = grouper.group(&events, None);
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        assert_eq!(set.key, "run:github:p-42");
        assert_eq!(set.services, vec!["api", "db", "worker"]);
        assert_eq!(set.confidence, 0.92);
        assert_eq!(set.event_count, 3);
        // events come out sorted by timestamp
        assert_eq!(set.events[0].service, "api");
        assert_eq!(set.events[2].service, "db");
    }

    #[test]
    fn explicit_change_set_id_wins_over_run_keys() {
        let grouper = ChangeSetGrouper::new();
        let mut e = event("api", 1);
        e.change_set_id = Some("release-9".into());
        e.metadata
            .insert("pipeline_id".into(), Value::String("p-1".into()));
        let sets = grouper.group(&[e], None);
        assert_eq!(sets[0].key, "explicit:release-9");
        assert_eq!(sets[0].confidence, 1.0);
    }

    #[test]
    fn pr_beats_commit_and_commit_beats_bucket() {
        let grouper = ChangeSetGrouper::new();

        let mut pr = event("api", 1);
        pr.repository = Some("acme/api".into());
        pr.pr_number = Some(12);
        pr.commit_sha = Some("abcd1234".into());
        let sets = grouper.group(std::slice::from_ref(&pr), None);
        assert_eq!(sets[0].key, "pr:acme/api:12");
        assert_eq!(sets[0].confidence, 0.90);

        let mut commit = event("api", 1);
        commit.repository = Some("acme/api".into());
        commit.commit_sha = Some("abcd1234".into());
        let sets = grouper.group(std::slice::from_ref(&commit), None);
        assert_eq!(sets[0].key, "commit:acme/api:abcd1234");
        assert_eq!(sets[0].confidence, 0.86);

        let lone = event("api", 1);
        let sets = grouper.group(std::slice::from_ref(&lone), None);
        assert!(sets[0].key.starts_with("bucket:production:api:"));
        assert_eq!(sets[0].confidence, 0.62);
    }

    #[test]
    fn time_bucket_splits_distant_events() {
        let grouper = ChangeSetGrouper::new();
        let recent = event("api", 0);
        let old = event("api", 120);
        let sets = grouper.group(&[recent, old], None);
        assert_eq!(sets.len(), 2);
    }

    #[test]
    fn mixed_environment_is_reported() {
        let grouper = ChangeSetGrouper::new();
        let mut a = event("api", 1);
        let mut b = event("api", 2);
        for (e, env) in [(&mut a, "production"), (&mut b, "staging")] {
            e.environment = env.to_string();
            e.metadata
                .insert("run_id".into(), Value::String("r-1".into()));
        }
        let sets = grouper.group(&[a, b], None);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].environment, "mixed");
    }

    #[test]
    fn readiness_from_file_paths() {
        let missing = compute_readiness(&["src/x.ts".to_string()], &[], None);
        assert_eq!(missing.runbook_updated, ReadinessState::Missing);
        assert!(missing
            .notes
            .iter()
            .any(|n| n.contains("runbook")));

        let updated = compute_readiness(&["docs/runbooks/api.md".to_string()], &[], None);
        assert_eq!(updated.runbook_updated, ReadinessState::Updated);

        let unknown = compute_readiness(&[], &[], None);
        assert_eq!(unknown.runbook_updated, ReadinessState::Unknown);

        let monitoring =
            compute_readiness(&["dashboards/grafana/api.json".to_string()], &[], None);
        assert_eq!(monitoring.monitoring_updated, ReadinessState::Updated);
    }

    #[test]
    fn ownership_requires_team_or_owner_on_every_service() {
        let mut graph = ServiceGraph::new();
        let mut owned = ServiceNode::new("api");
        owned.team = Some("platform".into());
        graph.add_service(owned);
        graph.add_service(ServiceNode::new("db"));

        let delta = compute_readiness(&[], &["api".to_string()], Some(&graph));
        assert_eq!(delta.ownership_known, ReadinessState::Updated);

        let delta = compute_readiness(
            &[],
            &["api".to_string(), "db".to_string()],
            Some(&graph),
        );
        assert_eq!(delta.ownership_known, ReadinessState::Missing);
        assert!(delta.notes.iter().any(|n| n.contains("db")));
    }

    #[test]
    fn group_score_mixes_max_and_mean() {
        use crate::analyzer::correlation::{ChangeCorrelation, CorrelationConfidence};
        let grouper = ChangeSetGrouper::new();
        let analyzer = BlastRadiusAnalyzer::new();
        let graph = ServiceGraph::new();

        let mut a = event("api", 1);
        let mut b = event("worker", 2);
        for e in [&mut a, &mut b] {
            e.metadata
                .insert("pipeline_id".into(), Value::String("p-9".into()));
        }
        let correlation = |event: ChangeEvent, score: f64| ChangeCorrelation {
            change_event: event,
            correlation_score: score,
            correlation_reasons: vec![],
            why_relevant: vec![format!("scored {}", score)],
            service_overlap: vec![],
            time_delta_minutes: 0,
            confidence: CorrelationConfidence::default(),
            evidence: vec![],
        };
        let ranked = grouper.rank_for_incident(
            &[correlation(a, 0.8), correlation(b, 0.4)],
            &graph,
            &analyzer,
            None,
        );
        assert_eq!(ranked.len(), 1);
        // 0.65 * 0.8 + 0.35 * 0.6 = 0.73
        assert_eq!(ranked[0].score, 0.73);
        assert_eq!(ranked[0].confidence.overall, 0.73);
        assert!(ranked[0].why_relevant.len() <= WHY_RELEVANT_CAP);
    }
}
