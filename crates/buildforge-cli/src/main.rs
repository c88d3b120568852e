//! buildforge - run the build pipeline from the command line.
//!
//! ## Commands
//!
//! - `build`: clean and build the project
//! - `package`: build, package and archive the staging tree
//! - `info`: show metadata of the canonical archive
//! - `fetch`: copy the canonical archive out, rebuilding it if missing
//! - `download`: copy a named artifact out
//! - `inventory`: list a directory tree
//!
//! Results are printed to stdout as JSON; the exit code is non-zero when the
//! command failed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildforge_core::{
    init_tracing, inventory, BuildforgeConfig, PackageFailure, Pipeline, PipelineError,
    PublishResolver, ResolvedArtifact,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "buildforge")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, package and publish a project", long_about = None)]
struct Cli {
    /// Path to buildforge.toml (default: built-in defaults for the current directory)
    #[arg(short, long, global = true, env = "BUILDFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean then build the project
    Build,

    /// Build, run the packaging target and archive the staging tree
    Package,

    /// Show metadata of the canonical archive
    Info,

    /// Copy the canonical archive, rebuilding it once if it is missing
    Fetch {
        /// Destination (default: archive file name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Copy a named artifact from the published locations
    Download {
        /// Artifact file name
        name: String,

        /// Destination (default: artifact name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the manifest of a directory tree
    Inventory {
        /// Directory to list
        dir: PathBuf,
    },
}

/// Command result: what to print and whether it counts as success.
struct Outcome {
    success: bool,
    body: Value,
}

impl Outcome {
    fn ok(body: impl Serialize) -> Self {
        Self {
            success: true,
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }

    fn failed(body: Value) -> Self {
        Self {
            success: false,
            body,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<BuildforgeConfig> {
    match path {
        Some(path) => BuildforgeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            Ok(BuildforgeConfig::for_project(cwd))
        }
    }
}

fn error_body(err: &PipelineError) -> Value {
    let mut body = json!({
        "success": false,
        "code": err.code(),
        "error": err.to_string(),
    });
    if let Some(result) = err.build_result() {
        body["build"] = serde_json::to_value(result).unwrap_or(Value::Null);
    }
    match err {
        PipelineError::ArtifactNotFound {
            searched,
            listing,
            rebuild,
            ..
        } => {
            body["searched"] = json!(searched);
            body["listing"] = json!(listing);
            if let Some(failure) = rebuild {
                body["rebuild"] = failure_body(failure);
            }
        }
        PipelineError::StagingTreeMissing { listing, .. } => {
            body["listing"] = json!(listing);
        }
        _ => {}
    }
    body
}

async fn cmd_build(pipeline: &Pipeline) -> Outcome {
    match pipeline.build().await {
        Ok(result) => Outcome::ok(result),
        Err(err) => Outcome::failed(error_body(&err)),
    }
}

fn failure_body(failure: &PackageFailure) -> Value {
    let mut body = error_body(&failure.error);
    body["run_id"] = json!(failure.run_id);
    body["stage"] = json!(failure.stage);
    body["states"] = json!(failure.states);
    body
}

async fn cmd_package(pipeline: &Pipeline) -> Outcome {
    match pipeline.package().await {
        Ok(result) => Outcome::ok(result),
        Err(failure) => Outcome::failed(failure_body(&failure)),
    }
}

async fn cmd_info(pipeline: &Pipeline) -> Outcome {
    Outcome::ok(pipeline.package_info().await)
}

async fn cmd_fetch(resolver: &PublishResolver, output: Option<&Path>) -> Result<Outcome> {
    match resolver.resolve().await {
        Ok(artifact) => save_artifact(artifact, output).await,
        Err(err) => Ok(Outcome::failed(error_body(&err))),
    }
}

async fn cmd_download(
    resolver: &PublishResolver,
    name: &str,
    output: Option<&Path>,
) -> Result<Outcome> {
    match resolver.resolve_download(name).await {
        Ok(artifact) => save_artifact(artifact, output).await,
        Err(err) => Ok(Outcome::failed(error_body(&err))),
    }
}

fn cmd_inventory(dir: &Path) -> Outcome {
    if !dir.is_dir() {
        return Outcome::failed(json!({
            "success": false,
            "error": format!("not a directory: {}", dir.display()),
        }));
    }
    let manifest = inventory(dir);
    Outcome::ok(json!({
        "root": dir,
        "directories": manifest.directory_count(),
        "files": manifest.files().len(),
        "total_bytes": manifest.total_bytes(),
        "manifest": manifest,
    }))
}

async fn save_artifact(mut artifact: ResolvedArtifact, output: Option<&Path>) -> Result<Outcome> {
    let dest = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&artifact.name));
    debug!(from = %artifact.path.display(), to = %dest.display(), "Copying artifact");

    let mut out = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let copied = tokio::io::copy(&mut artifact.file, &mut out)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;

    Ok(Outcome::ok(json!({
        "success": true,
        "name": artifact.name,
        "source": artifact.path,
        "output": dest,
        "size_bytes": copied,
        "rebuilt": artifact.rebuilt,
    })))
}

async fn run(cli: Cli) -> Result<Outcome> {
    if let Commands::Inventory { dir } = &cli.command {
        return Ok(cmd_inventory(dir));
    }

    let config = load_config(cli.config.as_deref())?;
    let pipeline = Arc::new(Pipeline::new(config).context("Invalid configuration")?);
    let resolver = PublishResolver::new(Arc::clone(&pipeline));

    match cli.command {
        Commands::Build => Ok(cmd_build(&pipeline).await),
        Commands::Package => Ok(cmd_package(&pipeline).await),
        Commands::Info => Ok(cmd_info(&pipeline).await),
        Commands::Fetch { output } => cmd_fetch(&resolver, output.as_deref()).await,
        Commands::Download { name, output } => {
            cmd_download(&resolver, &name, output.as_deref()).await
        }
        Commands::Inventory { dir } => Ok(cmd_inventory(&dir)),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing(cli.json, level);

    let outcome = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.body)?);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
