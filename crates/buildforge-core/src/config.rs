//! Service configuration.
//!
//! Every filesystem location the pipeline touches (project root, staging
//! tree, archive destination) lives here and is passed into the components
//! explicitly, so tests can point a pipeline at a temporary directory.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::guard::ConcurrencyPolicy;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid suggestion rule '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the build service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BuildforgeConfig {
    /// Toolchain commands and execution budget.
    pub toolchain: ToolchainConfig,

    /// Where produced artifacts are expected and published.
    pub artifacts: ArtifactsConfig,

    /// HTTP listener settings.
    pub server: ServerConfig,

    /// What to do when a build is requested while another one runs.
    pub concurrency: ConcurrencyPolicy,

    /// Extra failure hints, evaluated before the built-in table.
    pub suggestions: Vec<SuggestionRuleConfig>,
}

/// Toolchain invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Working directory for every toolchain command.
    pub project_dir: PathBuf,

    /// Clean command. Empty disables the clean step.
    pub clean: Vec<String>,

    /// Build command (first element is the executable).
    pub build: Vec<String>,

    /// Packaging target command.
    pub package: Vec<String>,

    /// Wall-clock budget per invocation, in milliseconds.
    pub timeout_ms: u64,

    /// Maximum captured bytes per output stream.
    pub max_output_bytes: usize,

    /// Run clean and build before the packaging target.
    pub build_before_package: bool,

    /// Extra environment variables passed to the toolchain.
    pub env: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            clean: vec!["make".to_string(), "clean".to_string()],
            build: vec!["make".to_string()],
            package: vec!["make".to_string(), "package".to_string()],
            timeout_ms: 600_000,
            max_output_bytes: 10 * 1024 * 1024,
            build_before_package: true,
            env: BTreeMap::new(),
        }
    }
}

/// Artifact locations. Relative paths are resolved against `project_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Parent output directory of the staging tree; listed on failures.
    pub output_dir: PathBuf,

    /// Directory the packaging target is expected to produce.
    pub staging_dir: PathBuf,

    /// Canonical archive destination.
    pub archive_path: PathBuf,

    /// Compiled output directory, searched last by downloads.
    pub compiled_output_dir: PathBuf,

    /// Side-built binary copied into the staging tree when present.
    pub side_artifact: Option<PathBuf>,

    /// Subdirectory of the staging tree that receives the side artifact.
    pub side_artifact_subdir: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("build"),
            staging_dir: PathBuf::from("build/staging"),
            archive_path: PathBuf::from("dist/package.zip"),
            compiled_output_dir: PathBuf::from("build/bin"),
            side_artifact: None,
            side_artifact_subdir: "tools".to_string(),
        }
    }
}

impl ArtifactsConfig {
    /// Directory holding the canonical archive.
    pub fn archive_dir(&self) -> &Path {
        self.archive_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// File name of the canonical archive.
    pub fn archive_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package.zip".to_string())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// A user-supplied `(pattern, hint)` pair for failure classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestionRuleConfig {
    pub name: String,
    pub pattern: String,
    pub hint: String,
}

impl BuildforgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// A relative `project_dir` is resolved against the file's directory;
    /// artifact paths are then resolved against `project_dir`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at `project_dir`.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.toolchain.project_dir = project_dir.into();
        config.resolve_paths(Path::new("."));
        config
    }

    /// Make every configured path absolute (or at least rooted at `base`).
    pub fn resolve_paths(&mut self, base: &Path) {
        self.toolchain.project_dir = join_relative(base, &self.toolchain.project_dir);

        let root = self.toolchain.project_dir.clone();
        let artifacts = &mut self.artifacts;
        artifacts.output_dir = join_relative(&root, &artifacts.output_dir);
        artifacts.staging_dir = join_relative(&root, &artifacts.staging_dir);
        artifacts.archive_path = join_relative(&root, &artifacts.archive_path);
        artifacts.compiled_output_dir = join_relative(&root, &artifacts.compiled_output_dir);
        if let Some(side) = artifacts.side_artifact.take() {
            artifacts.side_artifact = Some(join_relative(&root, &side));
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let toolchain = &self.toolchain;
        if toolchain.build.is_empty() {
            return Err(ConfigError::Invalid("toolchain.build must not be empty".into()));
        }
        if toolchain.package.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.package must not be empty".into(),
            ));
        }
        if toolchain.timeout_ms == 0 {
            return Err(ConfigError::Invalid("toolchain.timeout_ms must be > 0".into()));
        }
        if toolchain.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "toolchain.max_output_bytes must be > 0".into(),
            ));
        }
        if self.artifacts.archive_path.file_name().is_none() {
            return Err(ConfigError::Invalid(
                "artifacts.archive_path must name a file".into(),
            ));
        }
        let subdir = Path::new(&self.artifacts.side_artifact_subdir);
        if subdir.is_absolute() || subdir.components().any(|c| c.as_os_str() == "..") {
            return Err(ConfigError::Invalid(
                "artifacts.side_artifact_subdir must stay inside the staging tree".into(),
            ));
        }
        Ok(())
    }
}

fn join_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BuildforgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, ConcurrencyPolicy::Reject);
        assert_eq!(config.toolchain.timeout_ms, 600_000);
        assert!(config.toolchain.build_before_package);
    }

    #[test]
    fn test_for_project_roots_artifacts() {
        let config = BuildforgeConfig::for_project("/srv/app");
        assert_eq!(config.toolchain.project_dir, PathBuf::from("/srv/app"));
        assert_eq!(
            config.artifacts.staging_dir,
            PathBuf::from("/srv/app/build/staging")
        );
        assert_eq!(
            config.artifacts.archive_path,
            PathBuf::from("/srv/app/dist/package.zip")
        );
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let mut config = BuildforgeConfig::default();
        config.artifacts.archive_path = PathBuf::from("/var/www/out.zip");
        config.resolve_paths(Path::new("/etc/buildforge"));
        assert_eq!(config.artifacts.archive_path, PathBuf::from("/var/www/out.zip"));
        assert_eq!(
            config.toolchain.project_dir,
            PathBuf::from("/etc/buildforge/.")
        );
    }

    #[test]
    fn test_archive_dir_and_name() {
        let config = BuildforgeConfig::for_project("/srv/app");
        assert_eq!(config.artifacts.archive_dir(), Path::new("/srv/app/dist"));
        assert_eq!(config.artifacts.archive_name(), "package.zip");
    }

    #[test]
    fn test_validate_rejects_empty_package_command() {
        let mut config = BuildforgeConfig::default();
        config.toolchain.package.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("toolchain.package"));
    }

    #[test]
    fn test_validate_rejects_escaping_subdir() {
        let mut config = BuildforgeConfig::default();
        config.artifacts.side_artifact_subdir = "../outside".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildforge.toml");
        std::fs::write(
            &path,
            r#"
concurrency = "queue"

[toolchain]
project_dir = "app"
build = ["cargo", "build"]
package = ["cargo", "package"]
timeout_ms = 1000

[artifacts]
staging_dir = "out/publish"
side_artifact = "out/bin/helper"

[[suggestions]]
name = "lockfile"
pattern = "lock file .* out of date"
hint = "Regenerate the lock file."
"#,
        )
        .unwrap();

        let config = BuildforgeConfig::load(&path).unwrap();
        assert_eq!(config.concurrency, ConcurrencyPolicy::Queue);
        assert_eq!(config.toolchain.project_dir, dir.path().join("app"));
        assert_eq!(config.toolchain.timeout_ms, 1000);
        assert_eq!(
            config.artifacts.staging_dir,
            dir.path().join("app").join("out/publish")
        );
        assert_eq!(
            config.artifacts.side_artifact,
            Some(dir.path().join("app").join("out/bin/helper"))
        );
        assert_eq!(config.suggestions.len(), 1);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.toolchain.clean, vec!["make", "clean"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = BuildforgeConfig::load(Path::new("/nonexistent/buildforge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "toolchain = [").unwrap();
        let err = BuildforgeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
