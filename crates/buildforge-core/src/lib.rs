//! Buildforge core library.
//!
//! Drives an external build toolchain for one project, packages the staged
//! output into a compressed archive, and resolves published artifacts for
//! download. Every pipeline run goes through a single [`Pipeline`] and its
//! single-flight guard.

pub mod archive;
pub mod config;
pub mod error;
pub mod guard;
pub mod locator;
pub mod packager;
pub mod pipeline;
pub mod publish;
pub mod telemetry;
pub mod toolchain;

pub use archive::{ArchiveError, ArchiveSummary, Archiver, ZipArchiver};
pub use config::{
    ArtifactsConfig, BuildforgeConfig, ConfigError, ServerConfig, SuggestionRuleConfig,
    ToolchainConfig,
};
pub use error::{PipelineError, Result};
pub use guard::{ConcurrencyPolicy, PipelineGuard, PipelinePermit};
pub use locator::{inventory, locate, Manifest, ManifestEntry};
pub use packager::{PackageFailure, PackageResult, Packager, PackagerState};
pub use pipeline::Pipeline;
pub use publish::{package_info, PackageInfo, PublishResolver, ResolvedArtifact};
pub use telemetry::init_tracing;
pub use toolchain::{
    BuildResult, InvocationStatus, OutputStream, ProcessToolchain, SuggestionTable, Toolchain,
    ToolchainLimits, ToolchainStage,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
