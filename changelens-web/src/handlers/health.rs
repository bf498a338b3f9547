use axum::{extract::State, response::Json};
use serde::Serialize;

use changelens_core::{GraphStats, StoreStats};

use crate::{error_handling::AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub store: StoreStats,
    pub graph: GraphStats,
}

pub async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let store = state.pipeline.store().stats().await?;
    let graph = state.pipeline.graph().read().await.stats();
    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        store,
        graph,
    }))
}
