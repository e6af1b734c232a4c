use anyhow::Context as _;
use lab_report_service::{ServiceConfig, create_app, telemetry::init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    info!(
        llm_model = %config.llm_model,
        vision_model = %config.vision_model,
        timeout_secs = config.timeout.as_secs(),
        "Loaded configuration"
    );

    let app = create_app(&config).context("failed to build application")?;
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let addr = listener.local_addr()?;

    info!("Lab Report Analysis Service starting on {}", addr);
    info!("API Documentation available at http://{}/", addr);
    info!("Health check endpoint: http://{}/health", addr);
    info!("Analysis endpoint: POST http://{}/reports/analyze", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
