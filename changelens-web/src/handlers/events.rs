use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use changelens_core::{
    ChangeEvent, ChangeEventUpdate, ChangeType, EventQuery, EventSource, EventStatus, Initiator,
    NewChangeEvent,
};

use crate::{error_handling::AppResult, AppState};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Creates an event. A repeated idempotency key returns the original event
/// with 200 instead of 201; the header is honored when the body carries no
/// key of its own.
pub async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut partial): Json<NewChangeEvent>,
) -> AppResult<(StatusCode, Json<ChangeEvent>)> {
    if partial.idempotency_key.is_none() {
        if let Some(key) = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            partial.idempotency_key = Some(key.to_string());
        }
    }

    let outcome = state.pipeline.create_event(partial).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.event)))
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub events: Vec<NewChangeEvent>,
}

#[derive(Debug, Serialize)]
pub struct BatchCreateResponse {
    pub events: Vec<ChangeEvent>,
    pub count: usize,
}

pub async fn batch_create(
    State(state): State<AppState>,
    Json(request): Json<BatchCreateRequest>,
) -> AppResult<(StatusCode, Json<BatchCreateResponse>)> {
    let events = state.pipeline.batch_create(request.events).await?;
    let count = events.len();
    Ok((
        StatusCode::CREATED,
        Json(BatchCreateResponse { events, count }),
    ))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ChangeEvent>> {
    Ok(Json(state.pipeline.store().get(&id).await?))
}

pub async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ChangeEventUpdate>,
) -> AppResult<Json<ChangeEvent>> {
    Ok(Json(state.pipeline.store().update(&id, update).await?))
}

pub async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    state.pipeline.store().delete(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Query-string shape for event filtering; list filters are comma-separated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventQueryParams {
    pub services: Option<String>,
    pub change_types: Option<String>,
    pub sources: Option<String>,
    pub environment: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub initiator: Option<Initiator>,
    pub status: Option<EventStatus>,
    pub limit: Option<i64>,
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl EventQueryParams {
    fn into_query(self) -> AppResult<EventQuery> {
        let change_types = split_csv(&self.change_types)
            .iter()
            .map(|raw| raw.parse::<ChangeType>())
            .collect::<Result<Vec<_>, _>>()?;
        let sources = split_csv(&self.sources)
            .iter()
            .map(|raw| raw.parse::<EventSource>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EventQuery {
            services: split_csv(&self.services),
            change_types,
            sources,
            environment: self.environment,
            since: self.since,
            until: self.until,
            initiator: self.initiator,
            status: self.status,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<ChangeEvent>,
    pub count: usize,
}

pub async fn query_events(
    State(state): State<AppState>,
    Query(params): Query<EventQueryParams>,
) -> AppResult<Json<EventListResponse>> {
    let query = params.into_query()?;
    let events = state.pipeline.store().query(&query).await?;
    let count = events.len();
    Ok(Json(EventListResponse { events, count }))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<i64>,
}

pub async fn search_events(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<EventListResponse>> {
    let events = state
        .pipeline
        .store()
        .search(&params.q, params.limit)
        .await?;
    let count = events.len();
    Ok(Json(EventListResponse { events, count }))
}
