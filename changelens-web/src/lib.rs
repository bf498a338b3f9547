// ChangeLens Web Backend
// HTTP transport for the change intelligence core

pub mod config;
pub mod error_handling;
pub mod handlers;
pub mod routes;

pub use config::WebConfig;
pub use error_handling::{AppError, AppResult};

use std::sync::Arc;

use changelens_core::{ChangeCorrelator, EventStore, IngestPipeline, ServiceGraph};

// Main application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub correlator: Arc<ChangeCorrelator>,
    pub config: WebConfig,
}

impl AppState {
    pub async fn new(config: WebConfig) -> anyhow::Result<Self> {
        let store = EventStore::open(&config.database_url).await?;

        let graph = match &config.graph_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let graph = ServiceGraph::from_yaml(&raw)?;
                tracing::info!(
                    nodes = graph.node_count(),
                    edges = graph.edge_count(),
                    "loaded service graph from {}",
                    path
                );
                graph
            }
            None => ServiceGraph::new(),
        };

        let pipeline = IngestPipeline::new(store, graph).with_edge_inference(config.infer_edges);

        Ok(Self {
            pipeline: Arc::new(pipeline),
            correlator: Arc::new(ChangeCorrelator::new()),
            config,
        })
    }
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Build the full application router for the given state.
pub fn create_app(state: AppState) -> axum::Router {
    use axum::Router;
    use tower::ServiceBuilder;
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .nest("/api", routes::api_routes())
        .fallback(error_handling::handle_404)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Start the web server with the given configuration.
pub async fn start_server(config: WebConfig) -> anyhow::Result<()> {
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    // Use try_init() to avoid a panic when tests or an embedding binary
    // already initialized the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    tracing::info!("Starting ChangeLens web server on port {}", config.port);

    let state = AppState::new(config.clone()).await?;
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
