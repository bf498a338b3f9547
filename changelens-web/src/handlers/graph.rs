use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use changelens_core::{
    CoreError, DependencyEdge, GraphConfig, GraphExport, GraphStats, ServiceGraph, ServiceNode,
};

use crate::{error_handling::AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct GraphImportResponse {
    pub imported_nodes: usize,
    pub imported_edges: usize,
    pub stats: GraphStats,
}

/// Imports a graph layer. Accepts either the export shape
/// (`{ nodes, edges }`) or the config shape (`{ services, dependencies }`);
/// existing nodes and edges always win over the imported layer.
pub async fn import_graph(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Json<GraphImportResponse>> {
    let incoming = if body.get("nodes").is_some() || body.get("edges").is_some() {
        let export: GraphExport = serde_json::from_value(body)
            .map_err(|e| CoreError::validation(format!("invalid graph export: {}", e)))?;
        ServiceGraph::from_export(export)
    } else if body.get("services").is_some() || body.get("dependencies").is_some() {
        let config: GraphConfig = serde_json::from_value(body)
            .map_err(|e| CoreError::validation(format!("invalid graph config: {}", e)))?;
        ServiceGraph::from_config(config)
    } else {
        return Err(CoreError::validation(
            "expected { nodes, edges } or { services, dependencies }",
        )
        .with_hint("see GET /api/graph/services for the node shape")
        .into());
    };

    let mut graph = state.pipeline.graph().write().await;
    let before_nodes = graph.node_count();
    let before_edges = graph.edge_count();
    graph.merge(&incoming, "import");
    let stats = graph.stats();
    let imported_nodes = stats.nodes - before_nodes;
    let imported_edges = stats.edges - before_edges;
    info!(imported_nodes, imported_edges, "imported graph layer");

    Ok(Json(GraphImportResponse {
        imported_nodes,
        imported_edges,
        stats,
    }))
}

pub async fn list_services(State(state): State<AppState>) -> AppResult<Json<Vec<ServiceNode>>> {
    let graph = state.pipeline.graph().read().await;
    Ok(Json(graph.services().into_iter().cloned().collect()))
}

#[derive(Debug, Serialize)]
pub struct ServiceDependenciesResponse {
    pub service: ServiceNode,
    pub dependencies: Vec<DependencyEdge>,
    pub dependents: Vec<DependencyEdge>,
}

pub async fn service_dependencies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ServiceDependenciesResponse>> {
    let graph = state.pipeline.graph().read().await;
    let service = graph
        .get_service(&id)
        .cloned()
        .ok_or_else(|| CoreError::not_found(format!("service {}", id)))?;
    Ok(Json(ServiceDependenciesResponse {
        service,
        dependencies: graph.outgoing_edges(&id).into_iter().cloned().collect(),
        dependents: graph.incoming_edges(&id).into_iter().cloned().collect(),
    }))
}

/// External discovery is a collaborator this service does not ship.
pub async fn discover(State(_state): State<AppState>) -> AppResult<Json<Value>> {
    Err(CoreError::not_implemented("graph discovery is not available").into())
}

pub async fn graph_stats(State(state): State<AppState>) -> AppResult<Json<GraphStats>> {
    let graph = state.pipeline.graph().read().await;
    Ok(Json(graph.stats()))
}

pub async fn export_graph(State(state): State<AppState>) -> AppResult<Json<GraphExport>> {
    let graph = state.pipeline.graph().read().await;
    Ok(Json(graph.to_export()))
}
