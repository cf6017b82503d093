/// Routeway: graph-based document routing engine
///
/// Main entry point for the Routeway server. Initializes configuration and starts
/// the HTTP server with model management, instance routing and task inbox endpoints.

use routeway::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Model and chain management at /api/models/* and /api/chains/*
/// - Instance routing at /api/instances/*
/// - Task inbox at /api/tasks/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and data/routeway.db, overridable via ROUTEWAY_* env vars
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
