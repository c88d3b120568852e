//! External toolchain invocation.
//!
//! - [`result`]: `BuildResult`, `InvocationStatus`
//! - [`runner`]: `ProcessToolchain` (subprocess with time/output budget)
//! - [`suggest`]: `SuggestionTable` failure classification

pub mod result;
pub mod runner;
pub mod suggest;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ToolchainConfig;
use crate::error::PipelineError;

pub use result::{BuildResult, InvocationStatus, OutputStream};
pub use runner::ProcessToolchain;
pub use suggest::{SuggestionRule, SuggestionTable};

/// Pipeline step a toolchain invocation belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainStage {
    Clean,
    Build,
    Package,
}

impl fmt::Display for ToolchainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolchainStage::Clean => f.write_str("clean"),
            ToolchainStage::Build => f.write_str("build"),
            ToolchainStage::Package => f.write_str("package"),
        }
    }
}

/// Time and output budget for one invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolchainLimits {
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl From<&ToolchainConfig> for ToolchainLimits {
    fn from(config: &ToolchainConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Executes toolchain commands.
///
/// Implementations never return an error: every outcome, including spawn
/// failures, is folded into the returned `BuildResult`.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn run(
        &self,
        stage: ToolchainStage,
        command: &[String],
        limits: &ToolchainLimits,
    ) -> BuildResult;
}

/// Clean (non-fatal) then build.
pub async fn run_clean_and_build(
    toolchain: &dyn Toolchain,
    config: &ToolchainConfig,
) -> Result<BuildResult, PipelineError> {
    let limits = ToolchainLimits::from(config);

    if !config.clean.is_empty() {
        let clean = toolchain
            .run(ToolchainStage::Clean, &config.clean, &limits)
            .await;
        if !clean.success {
            warn!(
                error = clean.error.as_deref().unwrap_or_default(),
                "Clean step failed, continuing with build"
            );
        }
    }

    let build = toolchain
        .run(ToolchainStage::Build, &config.build, &limits)
        .await;
    if build.success {
        Ok(build)
    } else {
        Err(PipelineError::ToolchainFailure {
            stage: ToolchainStage::Build,
            result: Box::new(build),
        })
    }
}
