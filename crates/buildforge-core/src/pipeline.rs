//! Pipeline entry point shared by every caller.

use std::sync::Arc;

use tracing::info;

use crate::archive::{Archiver, ZipArchiver};
use crate::config::BuildforgeConfig;
use crate::error::Result;
use crate::guard::{ConcurrencyPolicy, PipelineGuard};
use crate::packager::{PackageFailure, PackageResult, Packager};
use crate::publish::{package_info, PackageInfo};
use crate::toolchain::{run_clean_and_build, BuildResult, ProcessToolchain, SuggestionTable, Toolchain};

/// Owns configuration, toolchain, archiver and the single-flight guard.
///
/// Cheap to share behind an `Arc`; every build and package request for the
/// configured project goes through one instance.
pub struct Pipeline {
    config: Arc<BuildforgeConfig>,
    toolchain: Arc<dyn Toolchain>,
    archiver: Arc<dyn Archiver>,
    guard: PipelineGuard,
}

impl Pipeline {
    /// Pipeline backed by real subprocesses and the zip archiver.
    pub fn new(config: BuildforgeConfig) -> Result<Self> {
        config.validate()?;
        let suggestions = Arc::new(SuggestionTable::from_config(&config.suggestions)?);
        let toolchain = Arc::new(ProcessToolchain::from_config(&config.toolchain, suggestions));
        Ok(Self::with_components(
            config,
            toolchain,
            Arc::new(ZipArchiver::new()),
        ))
    }

    /// Pipeline over caller-supplied components.
    pub fn with_components(
        config: BuildforgeConfig,
        toolchain: Arc<dyn Toolchain>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            toolchain,
            archiver,
            guard: PipelineGuard::new(),
        }
    }

    pub fn config(&self) -> &BuildforgeConfig {
        &self.config
    }

    pub fn guard(&self) -> &PipelineGuard {
        &self.guard
    }

    /// Clean then build, under the guard.
    pub async fn build(&self) -> Result<BuildResult> {
        let _permit = self.guard.acquire(self.config.concurrency).await?;
        info!(project = %self.config.toolchain.project_dir.display(), "Build requested");
        run_clean_and_build(self.toolchain.as_ref(), &self.config.toolchain).await
    }

    /// Full package run, under the guard.
    pub async fn package(&self) -> std::result::Result<PackageResult, PackageFailure> {
        self.package_with(self.config.concurrency).await
    }

    /// Full package run with an explicit concurrency policy.
    pub async fn package_with(
        &self,
        policy: ConcurrencyPolicy,
    ) -> std::result::Result<PackageResult, PackageFailure> {
        let _permit = self
            .guard
            .acquire(policy)
            .await
            .map_err(PackageFailure::before_start)?;
        self.package_locked().await
    }

    /// Package run for a caller that already holds the guard.
    pub(crate) async fn package_locked(&self) -> std::result::Result<PackageResult, PackageFailure> {
        Packager::new(
            Arc::clone(&self.config),
            Arc::clone(&self.toolchain),
            Arc::clone(&self.archiver),
        )
        .package()
        .await
    }

    /// Stat of the canonical archive. No side effects.
    pub async fn package_info(&self) -> PackageInfo {
        package_info(&self.config.artifacts.archive_path).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("busy", &self.guard.is_busy())
            .finish()
    }
}
