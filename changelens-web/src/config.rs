use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub port: u16,
    pub database_url: String,
    /// Optional YAML file with the initial service graph
    /// (`{ services: [...], dependencies: [...] }`).
    pub graph_file: Option<String>,
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    pub infer_edges: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite://data/changelens.db".to_string(),
            graph_file: None,
            cors_origins: vec!["http://localhost:3000".to_string()],
            request_timeout_secs: 30,
            infer_edges: false,
        }
    }
}

impl WebConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = env::var("CHANGELENS_PORT") {
            config.port = port.parse()?;
        }

        // Try CHANGELENS_DATABASE_URL first, then DATABASE_URL
        if let Ok(db_url) = env::var("CHANGELENS_DATABASE_URL") {
            config.database_url = db_url;
        } else if let Ok(db_url) = env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(graph_file) = env::var("CHANGELENS_GRAPH_FILE") {
            if !graph_file.trim().is_empty() {
                config.graph_file = Some(graph_file);
            }
        }

        if let Ok(origins) = env::var("CHANGELENS_CORS_ORIGINS") {
            config.cors_origins = origins.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(timeout) = env::var("CHANGELENS_REQUEST_TIMEOUT") {
            config.request_timeout_secs = timeout.parse()?;
        }

        if let Ok(infer) = env::var("CHANGELENS_INFER_EDGES") {
            config.infer_edges = matches!(infer.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}
