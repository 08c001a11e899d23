mod error;
mod jobs;
mod routes;
mod state;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use state::{AppState, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use treescan_core::config::{ENV_DATABASE, ENV_REDIS_URL};
use treescan_core::{Config, ScanDeps};

#[derive(Parser)]
#[command(name = "treescan-service")]
#[command(about = "Run treescan scans as background jobs over HTTP", long_about = None)]
struct Args {
    #[arg(long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Config file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database path, overrides store.database
    #[arg(long, env = ENV_DATABASE)]
    db: Option<PathBuf>,

    /// Redis URL, overrides cache.redis_url
    #[arg(long, env = ENV_REDIS_URL)]
    redis_url: Option<String>,
}

fn load_config(args: &Args) -> treescan_core::Result<Config> {
    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.store.database = db.clone();
    }
    if let Some(url) = &args.redis_url {
        config.cache.redis_url = url.clone();
    }
    Ok(config)
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/jobs", post(routes::submit_job).get(routes::list_jobs))
        .route("/jobs/{id}", get(routes::get_job))
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/scans", get(routes::list_scans))
        .route("/scans/{id}", get(routes::get_scan))
        .route("/scans/{id}/chunks", get(routes::list_chunks))
        .route("/scans/{id}/failures", get(routes::list_failures))
        .route("/blobs/{hash}", get(routes::get_blob))
        .route("/status", get(routes::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("treescan_core=info,treescan_service=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state = match load_config(&args)
        .and_then(ScanDeps::from_config)
        .and_then(AppState::new)
    {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("{}", e.envelope().message);
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        %addr,
        cache = state.deps.cache.name(),
        database = %state.deps.config.store.database.display(),
        "treescan-service listening"
    );

    if let Err(e) = axum::serve(listener, build_router(state)).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
