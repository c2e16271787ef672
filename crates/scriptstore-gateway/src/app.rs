use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use scriptstore_core::config::ScriptStoreConfig;
use scriptstore_orchestrator::{Deployer, Executor, IdentityLocks};
use scriptstore_registry::VersionRegistry;
use scriptstore_sandbox::EnvironmentManager;
use scriptstore_scheduler::Scheduler;
use scriptstore_validator::Validator;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: ScriptStoreConfig,
    pub registry: Arc<VersionRegistry>,
    pub executor: Arc<Executor>,
    pub deployer: Deployer,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Wire every component from config. Each subsystem gets its own SQLite
    /// connection to the same file. The scheduler is built but not started.
    pub fn from_config(config: ScriptStoreConfig) -> anyhow::Result<Self> {
        let db_path = &config.database.path;

        let registry = Arc::new(VersionRegistry::new(open_db(db_path)?)?);
        let env = Arc::new(EnvironmentManager::new(
            config.toolchain.clone(),
            &config.storage.scripts_root,
            &config.storage.envs_root,
        ));
        let locks = Arc::new(IdentityLocks::new());

        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&env),
            Arc::clone(&locks),
            config.execution.timeout(),
            config.execution.history_output_chars,
        ));
        let scheduler = Arc::new(Scheduler::new(
            open_db(db_path)?,
            Arc::clone(&registry),
            executor.clone(),
            Duration::from_millis(config.scheduler.tick_millis.max(1)),
        )?);

        let validator = Arc::new(Validator::standard(&config, Arc::clone(&env)));
        let deployer = Deployer::new(
            Arc::clone(&registry),
            env,
            validator,
            Arc::clone(&scheduler),
            locks,
        );

        Ok(Self {
            config,
            registry,
            executor,
            deployer,
            scheduler,
        })
    }
}

fn open_db(path: &str) -> anyhow::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{health, scripts, webhooks};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/scripts", get(scripts::list_scripts))
        .route(
            "/scripts/upload",
            post(scripts::upload_script).layer(DefaultBodyLimit::max(scripts::MAX_UPLOAD_BYTES)),
        )
        .route("/scripts/register", post(scripts::register_script))
        .route("/scripts/{script_name}/run", post(scripts::run_script))
        .route(
            "/scripts/{script_name}/schedule",
            post(scripts::schedule_script).delete(scripts::unschedule_script),
        )
        .route("/scripts/{script_name}/status", get(scripts::script_status))
        .route("/scripts/{script_name}/runs", get(scripts::list_runs))
        .route("/webhook/github", post(webhooks::github_webhook))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
