//! metrics-ingest: WebSocket metrics ingestion server
//!
//! Accepts persistent WebSocket connections (plain or TLS), and appends
//! every received message as a JSON line with a `received_at` field to
//! the configured log file.

use metrics_ingest::config::Config;
use metrics_ingest::server::MonitorServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server = MonitorServer::bind(&config).await?;

    info!(
        url = %config.listen_url(),
        log_path = %server.log_path().display(),
        max_connections = config.max_connections,
        max_message_size = config.max_message_size,
        "Starting metrics-ingest server"
    );

    server.run().await?;
    Ok(())
}
