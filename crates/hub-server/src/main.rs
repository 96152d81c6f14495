#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use hub_config::HubConfig;
use hub_server::{build_app, run_maintenance_loop, AppState};
use hub_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hub-server", version, about = "Multi-agent coordination hub daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// Path to the SQLite database file. Accepts `sqlite::memory:` for an
    /// ephemeral, single-process store.
    #[arg(long, default_value = "hub.db")]
    db_path: String,

    /// Directory where uploaded artifact bytes are written.
    #[arg(long, default_value = ".coord-hub/artifacts")]
    artifact_root: PathBuf,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("hub=debug,hub_server=debug,tower_http=debug")
    } else {
        EnvFilter::new("hub=info,hub_server=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) = HubConfig::from_env();
    for warning in &warnings {
        warn!(name = %warning.name, reason = %warning.reason, "ignoring invalid config override");
    }

    tokio::fs::create_dir_all(&args.artifact_root)
        .await
        .with_context(|| format!("create artifact root {}", args.artifact_root.display()))?;

    let store = Store::connect(&args.db_path)
        .await
        .with_context(|| format!("open store at {}", args.db_path))?;

    let state = Arc::new(AppState::new(store, config, args.artifact_root.clone()));
    tokio::spawn(run_maintenance_loop(state.clone()));

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        db_path = %args.db_path,
        artifact_root = %args.artifact_root.display(),
        "hub-server listening"
    );

    axum::serve(listener, app).await.context("serve")
}
