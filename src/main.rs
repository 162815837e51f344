use anyhow::Context;
use s3gate::{config::GatewayConfig, init_gateway, init_tracing};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.yaml".to_string());

    let config = GatewayConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: s3gate [config_file])",
            config_path
        )
    })?;

    init_tracing(config.logging.format);

    init_gateway(config, shutdown_signal())
        .await
        .context("Gateway error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
