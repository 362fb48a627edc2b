use anyhow::{Context, Result};
use field_agent::FieldAgent;
use fieldlink::config::{apply_env_overrides, ENV_CONFIG};
use fieldlink::{load_config, Credentials, FieldConfig};
use std::time::Duration;
use tracing::{info, warn};

/// Interval between status log lines
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "field_agent=info,fieldlink=info".into()),
        )
        .init();

    info!("Field agent starting...");

    let mut config = match std::env::var(ENV_CONFIG) {
        Ok(path) => load_config(&path)?,
        Err(_) => FieldConfig::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    info!(
        api_url = %config.service.api_url,
        push_url = %config.service.push_url,
        queue_db = %config.queue.db_path,
        "Configuration loaded"
    );

    let token = config.service.access_token.clone();
    let agent = FieldAgent::from_config(config).context("Failed to start field agent")?;

    match token {
        Some(token) => agent.connect(Credentials::bearer(token)),
        None => warn!("FIELDLINK_TOKEN not set, push connection disabled"),
    }

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
            _ = status_ticker.tick() => match agent.status() {
                Ok(status) => info!(
                    connection = %status.connection,
                    pending = status.pending_items,
                    failed = status.failed_items,
                    hotspots = status.hotspots,
                    "Status"
                ),
                Err(e) => warn!(error = %e, "Failed to read status"),
            },
        }
    }

    agent.shutdown().await;
    Ok(())
}
