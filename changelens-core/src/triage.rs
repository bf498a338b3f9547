use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analyzer::blast_radius::BlastRadiusAnalyzer;
use crate::analyzer::change_sets::{ChangeSetGrouper, RankedChangeSet, DEFAULT_TRIAGE_RESULTS};
use crate::analyzer::correlation::{ChangeCorrelation, ChangeCorrelator, IncidentQuery};
use crate::error::CoreResult;
use crate::graph::ServiceGraph;
use crate::store::EventStore;

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
const DERIVED_SUSPECTS: i64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageRequest {
    pub incident_time: Option<DateTime<Utc>>,
    pub incident_environment: Option<String>,
    pub window_minutes: Option<i64>,
    pub suspected_services: Vec<String>,
    pub symptom_tags: Vec<String>,
    pub max_change_sets: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResponse {
    pub incident_time: DateTime<Utc>,
    pub window_minutes: i64,
    pub suspected_services: Vec<String>,
    /// True when the suspects were derived from recent event volume rather
    /// than supplied by the caller.
    pub suspects_derived: bool,
    pub symptom_tags: Vec<String>,
    pub correlations: Vec<ChangeCorrelation>,
    pub change_sets: Vec<RankedChangeSet>,
}

/// One-call incident triage: pick suspects, correlate recent changes, and
/// rank the change sets behind them.
pub async fn run_triage(
    store: &EventStore,
    graph: &ServiceGraph,
    request: TriageRequest,
) -> CoreResult<TriageResponse> {
    let incident_time = request.incident_time.unwrap_or_else(Utc::now);
    let window_minutes = request.window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);

    let (suspected_services, suspects_derived) = if request.suspected_services.is_empty() {
        let derived = store.top_services(window_minutes, DERIVED_SUSPECTS).await?;
        debug!(suspects = derived.len(), "derived triage suspects from event volume");
        (derived, true)
    } else {
        (request.suspected_services.clone(), false)
    };

    let correlator = ChangeCorrelator::new();
    let correlations = correlator
        .correlate(
            store,
            graph,
            &IncidentQuery {
                affected_services: suspected_services.clone(),
                incident_time: Some(incident_time),
                window_minutes: Some(window_minutes),
                incident_environment: request.incident_environment.clone(),
                ..Default::default()
            },
        )
        .await?;

    let grouper = ChangeSetGrouper::new();
    let analyzer = BlastRadiusAnalyzer::new();
    let change_sets = grouper.rank_for_incident(
        &correlations,
        graph,
        &analyzer,
        Some(request.max_change_sets.unwrap_or(DEFAULT_TRIAGE_RESULTS)),
    );

    Ok(TriageResponse {
        incident_time,
        window_minutes,
        suspected_services,
        suspects_derived,
        symptom_tags: request.symptom_tags,
        correlations,
        change_sets,
    })
}
