//! buildforged - HTTP front end for the build/package/publish pipeline.
//!
//! One process serves one project. Every request shares a single
//! [`Pipeline`], so at most one build or package run is active at a time.

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildforge_core::telemetry::{init_tracing, parse_level};
use buildforge_core::{BuildforgeConfig, ConcurrencyPolicy, Pipeline, VERSION};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "buildforged")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, package and artifact download service", long_about = None)]
struct Args {
    /// Path to buildforge.toml (default: built-in defaults for the current directory)
    #[arg(short, long, env = "BUILDFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.bind`
    #[arg(long, env = "BUILDFORGE_BIND")]
    bind: Option<SocketAddr>,

    /// Queue concurrent build/package requests instead of rejecting them
    #[arg(long)]
    queue: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "BUILDFORGE_LOG", default_value = "info")]
    log_level: String,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<BuildforgeConfig> {
    let mut config = match &args.config {
        Some(path) => BuildforgeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            BuildforgeConfig::for_project(cwd)
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.queue {
        config.concurrency = ConcurrencyPolicy::Queue;
    }
    Ok(config)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json, parse_level(&args.log_level));

    let config = load_config(&args)?;
    let bind = config.server.bind;
    let project = config.toolchain.project_dir.clone();
    let pipeline = Arc::new(Pipeline::new(config).context("Invalid configuration")?);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(%bind, project = %project.display(), version = VERSION, "buildforged listening");

    axum::serve(listener, routes::router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
