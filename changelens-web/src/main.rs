use changelens_web::{start_server, WebConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WebConfig::load()?;
    start_server(config).await
}
