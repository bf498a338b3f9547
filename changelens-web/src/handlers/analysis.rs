use std::future::Future;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use changelens_core::{
    run_triage, BlastRadiusPrediction, ChangeCorrelation, ChangeSetGrouper, ChangeType,
    CoreError, IncidentQuery, RankedChangeSet, TriageRequest, TriageResponse, VelocityMetric,
};
use changelens_core::analyzer::change_sets::DEFAULT_CORRELATE_RESULTS;

use crate::{
    error_handling::{AppError, AppResult},
    AppState,
};

/// Analysis endpoints carry the ambient deadline: work exceeding the
/// configured request timeout aborts with the timeout error kind.
async fn with_deadline<T, F>(state: &AppState, operation: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::from(
            CoreError::timeout(format!("{} exceeded {:?}", operation, deadline))
                .with_hint("retry with a narrower window or a longer deadline"),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CorrelateRequest {
    #[serde(flatten)]
    pub incident: IncidentQuery,
    #[serde(default)]
    pub include_change_sets: bool,
}

#[derive(Debug, Serialize)]
pub struct CorrelateResponse {
    pub correlations: Vec<ChangeCorrelation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_sets: Option<Vec<RankedChangeSet>>,
}

pub async fn correlate(
    State(state): State<AppState>,
    Json(request): Json<CorrelateRequest>,
) -> AppResult<Json<CorrelateResponse>> {
    with_deadline(&state, "correlate", async {
        let graph = state.pipeline.graph().read().await;
        let correlations = state
            .correlator
            .correlate(state.pipeline.store(), &graph, &request.incident)
            .await?;

        let change_sets = if request.include_change_sets {
            Some(ChangeSetGrouper::new().rank_for_incident(
                &correlations,
                &graph,
                state.pipeline.analyzer(),
                Some(DEFAULT_CORRELATE_RESULTS),
            ))
        } else {
            None
        };

        Ok(Json(CorrelateResponse {
            correlations,
            change_sets,
        }))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct BlastRadiusRequest {
    pub services: Vec<String>,
    #[serde(default)]
    pub change_type: Option<ChangeType>,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

pub async fn blast_radius(
    State(state): State<AppState>,
    Json(request): Json<BlastRadiusRequest>,
) -> AppResult<Json<BlastRadiusPrediction>> {
    if request.services.is_empty() {
        return Err(AppError::from(CoreError::validation(
            "at least one service is required",
        )));
    }
    with_deadline(&state, "blast radius", async {
        let graph = state.pipeline.graph().read().await;
        let analyzer = state.pipeline.analyzer();
        let prediction = match request.max_depth {
            Some(depth) => analyzer.predict_with_depth(
                &graph,
                &request.services,
                request.change_type,
                depth,
            ),
            None => analyzer.predict(&graph, &request.services, request.change_type),
        };
        Ok(Json(prediction))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct VelocityParams {
    pub window_minutes: Option<i64>,
    pub periods: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum VelocityResponse {
    Single(VelocityMetric),
    Trend(Vec<VelocityMetric>),
}

pub async fn velocity(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<VelocityParams>,
) -> AppResult<Json<VelocityResponse>> {
    let window_minutes = params.window_minutes.unwrap_or(60);
    if window_minutes <= 0 {
        return Err(AppError::from(CoreError::validation(
            "window_minutes must be positive",
        )));
    }
    let store = state.pipeline.store();
    let response = match params.periods {
        Some(periods) if periods > 1 => {
            VelocityResponse::Trend(store.velocity_trend(&service, window_minutes, periods).await?)
        }
        _ => VelocityResponse::Single(store.velocity(&service, window_minutes).await?),
    };
    Ok(Json(response))
}

pub async fn triage(
    State(state): State<AppState>,
    Json(request): Json<TriageRequest>,
) -> AppResult<Json<TriageResponse>> {
    with_deadline(&state, "triage", async {
        let graph = state.pipeline.graph().read().await;
        let response = run_triage(state.pipeline.store(), &graph, request).await?;
        Ok(Json(response))
    })
    .await
}
