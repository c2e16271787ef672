use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scriptstore_core::config::ScriptStoreConfig;
use tracing::{info, warn};

mod app;
mod http;

/// HTTP gateway for uploading, validating, running and scheduling scripts.
#[derive(Debug, Parser)]
#[command(name = "scriptstore-gateway", version)]
struct Cli {
    /// Config file; falls back to SCRIPTSTORE_CONFIG, then ~/.scriptstore/scriptstore.toml.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > SCRIPTSTORE_CONFIG > ~/.scriptstore/scriptstore.toml
    let config_path = cli
        .config
        .or_else(|| std::env::var("SCRIPTSTORE_CONFIG").ok());
    let (config, load_error) = match ScriptStoreConfig::load(config_path.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => {
            let mut config = ScriptStoreConfig::default();
            config.apply_plain_env();
            (config, Some(e))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(config.debug).into()),
        )
        .init();

    if let Some(e) = load_error {
        warn!("Config load failed ({}), using defaults", e);
    }
    if config.webhook.secret.is_none() {
        warn!("no webhook secret configured; POST /webhook/github will reject every request");
    }

    let bind = config.server.bind.clone();
    let port = config.server.port;

    ensure_parent_dir(&config.database.path)?;
    info!(path = %config.database.path, "opening SQLite database");

    let state = Arc::new(app::AppState::from_config(config)?);
    state.scheduler.start()?;
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("scriptstore gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop firing triggers; a run already in progress finishes on its own
    state.scheduler.stop()?;
    Ok(())
}

/// Filter used when RUST_LOG is unset. Warnings from every crate always pass.
fn default_filter(debug: bool) -> &'static str {
    if debug {
        "info,scriptstore_core=debug,scriptstore_registry=debug,scriptstore_sandbox=debug,\
         scriptstore_validator=debug,scriptstore_scheduler=debug,scriptstore_orchestrator=debug,\
         scriptstore_gateway=debug,tower_http=debug"
    } else {
        "warn,scriptstore_gateway=info,scriptstore_scheduler=info,\
         scriptstore_orchestrator=info,tower_http=info"
    }
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRATES: [&str; 7] = [
        "scriptstore_core",
        "scriptstore_registry",
        "scriptstore_sandbox",
        "scriptstore_validator",
        "scriptstore_scheduler",
        "scriptstore_orchestrator",
        "scriptstore_gateway",
    ];

    #[test]
    fn default_filter_keeps_warnings_from_every_crate() {
        let quiet = default_filter(false);
        assert!(quiet.starts_with("warn,"));
        assert!(!quiet.contains(' '));
        assert!(quiet.contains("scriptstore_orchestrator=info"));
        tracing_subscriber::EnvFilter::try_new(quiet).unwrap();

        let verbose = default_filter(true);
        assert!(!verbose.contains(' '));
        for name in CRATES {
            assert!(verbose.contains(&format!("{name}=debug")), "{name} missing");
        }
        tracing_subscriber::EnvFilter::try_new(verbose).unwrap();
    }

    #[test]
    fn database_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/data/scriptstore.db");
        ensure_parent_dir(db.to_str().unwrap()).unwrap();
        assert!(dir.path().join("nested/data").is_dir());
    }

    #[test]
    fn unusable_database_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let db = blocker.join("sub/scriptstore.db");

        let err = ensure_parent_dir(db.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("creating database directory"), "{err}");
    }
}
