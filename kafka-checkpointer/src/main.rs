use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_checkpointer::{
    config::Config,
    serve_metrics::{serve, setup_metrics_routes},
    service::CheckpointService,
};

pub async fn index() -> &'static str {
    "kafka checkpointer service"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router).context("Failed to install metrics recorder")?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Kafka checkpointer service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = CheckpointService::new(config)
        .context("Failed to create Kafka checkpointer service")?;

    // Blocks until ctrl+c or a fatal consumer error
    let result = service.run().await;

    server_handle.abort();

    result
}
