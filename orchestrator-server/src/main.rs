//! Orchestrator server: session control API, worker task API and an SSE
//! stream of session events.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use chrono::Utc;
use clap::Parser;
use orchestrator::Supervisor;
use orchestrator::io::init::OrchestratorPaths;
use orchestrator::io::store::LocalStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "orchestrator-server")]
#[command(about = "HTTP API and event stream for orchestrator sessions")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Directory containing .orchestrator/
    #[arg(long, default_value = ".")]
    home: PathBuf,

    /// Skip the abandoned-workspace sweep at startup.
    #[arg(long)]
    keep_abandoned: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestrator_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let home = args.home.canonicalize().unwrap_or(args.home);
    info!(home = %home.display(), "starting orchestrator-server");

    let paths = OrchestratorPaths::new(&home);
    let config = paths.load_config()?;
    let store = Arc::new(LocalStore::open(&paths.store_path).context("open store")?);
    let supervisor = Supervisor::new(store, config, &paths.workspaces_dir);

    let report = supervisor.startup_sweep().await?;
    info!(
        failed = report.failed_sessions.len(),
        requeued = report.requeued_tasks.len(),
        "startup sweep complete"
    );
    if !args.keep_abandoned {
        match supervisor.sweep_abandoned(Utc::now()).await {
            Ok(report) => info!(released = report.released.len(), "abandoned sweep complete"),
            Err(err) => warn!(err = %err, "abandoned sweep failed"),
        }
    }

    let state = AppState::new(supervisor, paths);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
