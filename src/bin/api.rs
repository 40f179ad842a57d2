use std::sync::Arc;
use support_agent_orchestrator::{api::start_server, AgentConfig, Orchestrator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env()?;

    info!("Support Agent Orchestrator - API Server");
    info!(port = config.api_port, knowledge_dir = %config.knowledge_dir.display(), "Configuration loaded");

    let (orchestrator, _outbox) = Orchestrator::from_config(&config).await?;
    let orchestrator = Arc::new(orchestrator);

    info!(oracle = orchestrator.oracle_name(), "Orchestrator initialized");

    start_server(orchestrator, config.knowledge_dir.clone(), config.api_port).await?;

    Ok(())
}
