//! Error taxonomy for the build/package/artifact pipeline.

use std::path::PathBuf;

use crate::archive::ArchiveError;
use crate::config::ConfigError;
use crate::locator::Manifest;
use crate::packager::PackageFailure;
use crate::toolchain::{BuildResult, ToolchainStage};

/// Pipeline errors. Every variant is terminal for the current request.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} step failed: {}", result.error.as_deref().unwrap_or("toolchain reported failure"))]
    ToolchainFailure {
        stage: ToolchainStage,
        result: Box<BuildResult>,
    },

    #[error(
        "toolchain succeeded but the staging directory was not produced: {}",
        path.display()
    )]
    StagingTreeMissing { path: PathBuf, listing: Manifest },

    #[error("archive output failed: {0}")]
    ArchiveIo(String),

    #[error("archive encoding failed: {0}")]
    ArchiveEncoding(String),

    #[error(
        "artifact not found: {name}{}",
        rebuild.as_ref().map(|f| format!(" (rebuild failed: {f})")).unwrap_or_default()
    )]
    ArtifactNotFound {
        name: String,
        searched: Vec<PathBuf>,
        listing: Vec<String>,
        /// The rebuild attempted before giving up, when it failed.
        rebuild: Option<Box<PackageFailure>>,
    },

    #[error("build in progress")]
    BuildInProgress,

    #[error("failed to copy side artifact {}: {source}", path.display())]
    SideArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable machine-readable code for responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ToolchainFailure { .. } => "toolchain_failure",
            PipelineError::StagingTreeMissing { .. } => "staging_tree_missing",
            PipelineError::ArchiveIo(_) => "archive_io_failure",
            PipelineError::ArchiveEncoding(_) => "archive_encoding_failure",
            PipelineError::ArtifactNotFound { .. } => "artifact_not_found",
            PipelineError::BuildInProgress => "build_in_progress",
            PipelineError::SideArtifact { .. } => "side_artifact_failure",
            PipelineError::Config(_) => "config_error",
            PipelineError::Io(_) => "io_error",
        }
    }

    /// The failing toolchain result, if this is a toolchain failure.
    pub fn build_result(&self) -> Option<&BuildResult> {
        match self {
            PipelineError::ToolchainFailure { result, .. } => Some(&**result),
            PipelineError::ArtifactNotFound {
                rebuild: Some(failure),
                ..
            } => failure.error.build_result(),
            _ => None,
        }
    }
}

impl From<ArchiveError> for PipelineError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::SourceMissing(path) => PipelineError::StagingTreeMissing {
                path,
                listing: Manifest::default(),
            },
            err @ ArchiveError::Output { .. } => PipelineError::ArchiveIo(err.to_string()),
            ArchiveError::Encoding(msg) => PipelineError::ArchiveEncoding(msg),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
