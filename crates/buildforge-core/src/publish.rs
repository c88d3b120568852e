//! Artifact serving: canonical archive with rebuild-on-miss, named
//! downloads, and archive metadata.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::guard::ConcurrencyPolicy;
use crate::locator::{download_candidates, list_dir};
use crate::pipeline::Pipeline;

/// An open artifact ready to stream.
#[derive(Debug)]
pub struct ResolvedArtifact {
    /// File name presented to the client.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Opened before any pipeline lock was released.
    pub file: File,
    /// Whether a rebuild produced this artifact.
    pub rebuilt: bool,
}

/// Metadata of the canonical archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageInfo {
    pub exists: bool,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Stat `path` without touching it.
pub async fn package_info(path: &Path) -> PackageInfo {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => PackageInfo {
            exists: true,
            path: path.to_path_buf(),
            size_bytes: Some(meta.len()),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            message: None,
        },
        _ => PackageInfo {
            exists: false,
            path: path.to_path_buf(),
            size_bytes: None,
            modified: None,
            message: Some("package does not exist".to_string()),
        },
    }
}

/// Serves published artifacts, rebuilding the canonical archive on a miss.
#[derive(Debug, Clone)]
pub struct PublishResolver {
    pipeline: Arc<Pipeline>,
}

impl PublishResolver {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Serve the canonical archive, running one package attempt if absent.
    ///
    /// Waits behind a running pipeline rather than rejecting. A failed
    /// rebuild yields a single `ArtifactNotFound`; nothing is retried.
    pub async fn resolve(&self) -> Result<ResolvedArtifact> {
        let artifacts = &self.pipeline.config().artifacts;
        let archive = &artifacts.archive_path;
        let name = artifacts.archive_name();

        if let Some(found) = open_file(archive, &name, false).await? {
            return Ok(found);
        }

        info!(archive = %archive.display(), "Canonical archive missing, rebuilding");
        let _permit = self.pipeline.guard().acquire(ConcurrencyPolicy::Queue).await?;

        // A run we queued behind may have produced it.
        if let Some(found) = open_file(archive, &name, false).await? {
            return Ok(found);
        }

        let rebuild = match self.pipeline.package_locked().await {
            Ok(result) => {
                info!(
                    run_id = %result.run_id,
                    size_bytes = result.archive_size_bytes,
                    "Rebuild produced archive"
                );
                None
            }
            Err(failure) => {
                warn!(
                    run_id = %failure.run_id,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Rebuild failed"
                );
                Some(Box::new(failure))
            }
        };

        match open_file(archive, &name, true).await? {
            Some(found) => Ok(found),
            None => Err(PipelineError::ArtifactNotFound {
                name,
                searched: vec![archive.clone()],
                listing: list_dir(artifacts.archive_dir()),
                rebuild,
            }),
        }
    }

    /// Serve `name` from the download candidates. Never rebuilds.
    ///
    /// Candidates are tried in order; anything that is not a regular file
    /// (a directory of the same name, say) is skipped.
    pub async fn resolve_download(&self, name: &str) -> Result<ResolvedArtifact> {
        let artifacts = &self.pipeline.config().artifacts;
        let not_found = |searched: Vec<PathBuf>| PipelineError::ArtifactNotFound {
            name: name.to_string(),
            searched,
            listing: list_dir(artifacts.archive_dir()),
            rebuild: None,
        };

        let Some(candidates) = download_candidates(artifacts, name) else {
            warn!(name, "Rejected download name");
            return Err(not_found(Vec::new()));
        };

        for candidate in &candidates {
            let served_name = candidate
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string());
            if let Some(artifact) = open_file(candidate, &served_name, false).await? {
                return Ok(artifact);
            }
            debug!(candidate = %candidate.display(), "Download candidate not a file");
        }
        Err(not_found(candidates))
    }
}

/// Open `path` if it is a regular file. Unopenable paths count as absent.
async fn open_file(path: &Path, name: &str, rebuilt: bool) -> Result<Option<ResolvedArtifact>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Cannot open artifact");
            }
            return Ok(None);
        }
    };
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Ok(None);
    }
    Ok(Some(ResolvedArtifact {
        name: name.to_string(),
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        file,
        rebuilt,
    }))
}
