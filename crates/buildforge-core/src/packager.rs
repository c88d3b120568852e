//! Package stage: toolchain packaging, staging validation, side artifact
//! augmentation and archiving, as an explicit state machine.
//!
//! ```text
//! Idle -> Building -> PackagingToolchain -> ValidatingStagingTree
//!      -> AugmentingArtifacts -> Archiving -> Done
//! (any state) -> Failed
//! ```
//!
//! Nothing is retried; callers re-invoke [`Packager::package`] to retry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::Archiver;
use crate::config::BuildforgeConfig;
use crate::error::PipelineError;
use crate::locator::{inventory, locate, Manifest};
use crate::toolchain::{
    run_clean_and_build, BuildResult, Toolchain, ToolchainLimits, ToolchainStage,
};

/// Packager states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackagerState {
    Idle,
    Building,
    PackagingToolchain,
    ValidatingStagingTree,
    AugmentingArtifacts,
    Archiving,
    Done,
    Failed,
}

impl fmt::Display for PackagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackagerState::Idle => "idle",
            PackagerState::Building => "building",
            PackagerState::PackagingToolchain => "packaging_toolchain",
            PackagerState::ValidatingStagingTree => "validating_staging_tree",
            PackagerState::AugmentingArtifacts => "augmenting_artifacts",
            PackagerState::Archiving => "archiving",
            PackagerState::Done => "done",
            PackagerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful package run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageResult {
    pub run_id: Uuid,
    pub success: bool,
    /// Clean+build result, when the build step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildResult>,
    /// Packaging target result.
    pub package: BuildResult,
    pub archive_path: PathBuf,
    pub archive_size_bytes: u64,
    /// Inventory of the staging tree that was archived.
    pub manifest: Manifest,
    /// Where the side artifact was copied, if it was present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_artifact: Option<PathBuf>,
    /// States visited, in order.
    pub states: Vec<PackagerState>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Terminal failure of a package run.
#[derive(Debug, thiserror::Error)]
#[error("package failed during {stage}: {error}")]
pub struct PackageFailure {
    pub run_id: Uuid,
    /// State the run was in when it failed.
    pub stage: PackagerState,
    #[source]
    pub error: PipelineError,
    /// States visited, ending with `Failed`.
    pub states: Vec<PackagerState>,
}

impl PackageFailure {
    /// Failure before the state machine left `Idle` (e.g. guard rejection).
    pub fn before_start(error: PipelineError) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: PackagerState::Idle,
            error,
            states: vec![PackagerState::Idle, PackagerState::Failed],
        }
    }
}

/// State trail of one run.
struct Transitions {
    run_id: Uuid,
    states: Vec<PackagerState>,
}

impl Transitions {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            states: vec![PackagerState::Idle],
        }
    }

    fn current(&self) -> PackagerState {
        self.states.last().copied().unwrap_or(PackagerState::Idle)
    }

    fn enter(&mut self, next: PackagerState) {
        debug!(run_id = %self.run_id, from = %self.current(), to = %next, "Packager transition");
        self.states.push(next);
    }

    fn fail(mut self, error: PipelineError) -> PackageFailure {
        let stage = self.current();
        warn!(run_id = %self.run_id, stage = %stage, code = error.code(), error = %error, "Package run failed");
        self.states.push(PackagerState::Failed);
        PackageFailure {
            run_id: self.run_id,
            stage,
            error,
            states: self.states,
        }
    }
}

/// Drives one package run over shared components.
pub struct Packager {
    config: Arc<BuildforgeConfig>,
    toolchain: Arc<dyn Toolchain>,
    archiver: Arc<dyn Archiver>,
}

impl Packager {
    pub fn new(
        config: Arc<BuildforgeConfig>,
        toolchain: Arc<dyn Toolchain>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            config,
            toolchain,
            archiver,
        }
    }

    /// Run the state machine from `Idle` to `Done` or `Failed`.
    ///
    /// The caller is responsible for holding the pipeline guard.
    pub async fn package(&self) -> Result<PackageResult, PackageFailure> {
        let start = Instant::now();
        let mut run = Transitions::start();
        let toolchain_config = &self.config.toolchain;
        let artifacts = &self.config.artifacts;
        info!(run_id = %run.run_id, "Starting package run");

        let build = if toolchain_config.build_before_package {
            run.enter(PackagerState::Building);
            match run_clean_and_build(self.toolchain.as_ref(), toolchain_config).await {
                Ok(result) => Some(result),
                Err(e) => return Err(run.fail(e)),
            }
        } else {
            None
        };

        run.enter(PackagerState::PackagingToolchain);
        let limits = ToolchainLimits::from(toolchain_config);
        let package = self
            .toolchain
            .run(ToolchainStage::Package, &toolchain_config.package, &limits)
            .await;
        if !package.success {
            return Err(run.fail(PipelineError::ToolchainFailure {
                stage: ToolchainStage::Package,
                result: Box::new(package),
            }));
        }

        run.enter(PackagerState::ValidatingStagingTree);
        let staging = &artifacts.staging_dir;
        if !locate(&[staging]).is_some_and(|p| p.is_dir()) {
            let listing = inventory(&artifacts.output_dir);
            return Err(run.fail(PipelineError::StagingTreeMissing {
                path: staging.clone(),
                listing,
            }));
        }

        run.enter(PackagerState::AugmentingArtifacts);
        let side_artifact = match self.augment(staging).await {
            Ok(copied) => copied,
            Err(e) => return Err(run.fail(e)),
        };

        run.enter(PackagerState::Archiving);
        let summary = match self.archiver.archive(staging, &artifacts.archive_path).await {
            Ok(summary) => summary,
            Err(e) => return Err(run.fail(e.into())),
        };
        let manifest = inventory(staging);

        run.enter(PackagerState::Done);
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run.run_id,
            archive = %summary.path.display(),
            size_bytes = summary.size_bytes,
            duration_ms,
            "Package run completed"
        );

        Ok(PackageResult {
            run_id: run.run_id,
            success: true,
            build,
            package,
            archive_path: summary.path,
            archive_size_bytes: summary.size_bytes,
            manifest,
            side_artifact,
            states: run.states,
            timestamp: Utc::now(),
            duration_ms,
        })
    }

    /// Copy the side artifact into the staging tree, if it exists.
    async fn augment(&self, staging: &Path) -> Result<Option<PathBuf>, PipelineError> {
        let artifacts = &self.config.artifacts;
        let Some(side) = artifacts.side_artifact.as_ref() else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(side).await.unwrap_or(false) {
            info!(path = %side.display(), "Side artifact not present, skipping");
            return Ok(None);
        }
        let Some(file_name) = side.file_name() else {
            return Ok(None);
        };

        let target_dir = staging.join(&artifacts.side_artifact_subdir);
        let target = target_dir.join(file_name);
        let copy_error = |source: std::io::Error| PipelineError::SideArtifact {
            path: side.clone(),
            source,
        };
        tokio::fs::create_dir_all(&target_dir).await.map_err(copy_error)?;
        tokio::fs::copy(side, &target).await.map_err(copy_error)?;

        info!(from = %side.display(), to = %target.display(), "Side artifact copied");
        Ok(Some(target))
    }
}
