/// Server setup and initialization
///
/// Wires together all components: storage, model registry, Lua scripting, the
/// in-memory task/permission/event services, the routing service, the escalation
/// scheduler and the HTTP routes.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    runtime::{
        collaborators::{Collaborators, NoSubRoutes},
        AuditLog, EscalationScheduler, InMemoryPermissions, InMemoryTaskService, LuaScripting,
        RoutingService,
    },
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Opens the database, loads models, chains and instances, and starts the
/// escalation scheduler in the background.
pub async fn create_app(config: Config) -> Result<Router> {
    ensure_database_dir(&config.database.url)?;

    tracing::info!("📋 Connecting workflow storage: {}", config.database.url);
    let storage = WorkflowStorage::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open workflow database: {}", e))?;

    tracing::info!("📊 Initializing model registry");
    let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load models from storage: {}", e))?;

    tracing::info!("📜 Loading automation chains");
    let scripting = Arc::new(LuaScripting::with_chains(storage.load_all_chains().await?));

    let state = build_state(registry, scripting, config.runtime.max_loops);
    state
        .service
        .load_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instances from storage: {}", e))?;

    tracing::info!("⏰ Initializing escalation scheduler");
    let scheduler = Arc::new(
        EscalationScheduler::new(Arc::clone(&state.service), config.runtime.escalation_schedule.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize escalation scheduler: {}", e))?,
    );
    tokio::spawn(async move {
        if let Err(e) = scheduler.start().await {
            tracing::error!("❌ Failed to start escalation scheduler: {}", e);
            return;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = scheduler.stop().await {
                tracing::error!("❌ Failed to stop escalation scheduler: {}", e);
            }
        }
    });

    tracing::info!("✅ Application initialized successfully");
    Ok(create_router(state))
}

/// Wire the in-memory collaborators and the routing service around a registry
pub fn build_state(registry: Arc<WorkflowRegistry>, scripting: Arc<LuaScripting>, max_loops: usize) -> AppState {
    let tasks = Arc::new(InMemoryTaskService::new());
    let audit = Arc::new(AuditLog::default());
    let collaborators = Collaborators {
        chains: scripting.clone(),
        expressions: scripting.clone(),
        tasks: tasks.clone(),
        permissions: Arc::new(InMemoryPermissions::new()),
        events: audit.clone(),
        sub_routes: Arc::new(NoSubRoutes),
    };
    let service = Arc::new(RoutingService::with_max_loops(
        Arc::clone(&registry),
        collaborators,
        max_loops,
    ));

    AppState {
        registry,
        service,
        tasks,
        scripting,
        audit,
    }
}

/// Router over an already wired state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Routeway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring database directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
    }
    Ok(())
}
