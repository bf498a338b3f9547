use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use crate::{handlers, AppState};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Event ingestion and lookup
        .route("/events", post(handlers::events::create_event))
        .route("/events", get(handlers::events::query_events))
        .route("/events/batch", post(handlers::events::batch_create))
        .route("/events/search", get(handlers::events::search_events))
        .route("/events/:id", get(handlers::events::get_event))
        .route("/events/:id", patch(handlers::events::update_event))
        .route("/events/:id", delete(handlers::events::delete_event))
        // Analytical queries
        .route("/correlate", post(handlers::analysis::correlate))
        .route("/blast-radius", post(handlers::analysis::blast_radius))
        .route("/velocity/:service", get(handlers::analysis::velocity))
        .route("/triage", post(handlers::analysis::triage))
        // Service graph
        .route("/graph/import", post(handlers::graph::import_graph))
        .route("/graph/export", get(handlers::graph::export_graph))
        .route("/graph/services", get(handlers::graph::list_services))
        .route(
            "/graph/services/:id/dependencies",
            get(handlers::graph::service_dependencies),
        )
        .route("/graph/discover", post(handlers::graph::discover))
        .route("/graph/stats", get(handlers::graph::graph_stats))
        // Health
        .route("/health", get(handlers::health::health))
}
