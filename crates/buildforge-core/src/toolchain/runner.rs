//! Subprocess toolchain runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::result::{BuildResult, InvocationStatus, OutputStream};
use super::suggest::SuggestionTable;
use super::{Toolchain, ToolchainLimits, ToolchainStage};
use crate::config::ToolchainConfig;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
enum CaptureError {
    #[error("{0} exceeded the output limit")]
    Overflow(OutputStream),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs toolchain commands as child processes in the project directory.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    project_dir: PathBuf,
    env: BTreeMap<String, String>,
    suggestions: Arc<SuggestionTable>,
}

impl ProcessToolchain {
    pub fn new(project_dir: impl Into<PathBuf>, suggestions: Arc<SuggestionTable>) -> Self {
        Self {
            project_dir: project_dir.into(),
            env: BTreeMap::new(),
            suggestions,
        }
    }

    /// Runner configured from the `[toolchain]` section.
    pub fn from_config(config: &ToolchainConfig, suggestions: Arc<SuggestionTable>) -> Self {
        Self {
            project_dir: config.project_dir.clone(),
            env: config.env.clone(),
            suggestions,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn finish(
        &self,
        stage: ToolchainStage,
        command: &str,
        status: InvocationStatus,
        stdout: &[u8],
        stderr: &[u8],
        start: Instant,
    ) -> BuildResult {
        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(stdout).to_string();
        let stderr = String::from_utf8_lossy(stderr).to_string();
        let result = BuildResult::new(stage, command, status, stdout, stderr, duration_ms);

        if result.success {
            info!(stage = %stage, duration_ms, "Toolchain step succeeded");
            return result;
        }

        // Only process output is classified; `error` embeds the command line.
        let spawn_message = match &result.status {
            InvocationStatus::SpawnFailed { message } => message.as_str(),
            _ => "",
        };
        let suggestion = self.suggestions.suggest(&[
            result.stderr.as_str(),
            result.stdout.as_str(),
            spawn_message,
        ]);
        let error = result.error.clone().unwrap_or_default();
        warn!(
            stage = %stage,
            exit_code = ?result.exit_code(),
            duration_ms,
            error = %error,
            classified = suggestion.is_some(),
            "Toolchain step failed"
        );
        result.with_suggestion(suggestion)
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn run(
        &self,
        stage: ToolchainStage,
        command: &[String],
        limits: &ToolchainLimits,
    ) -> BuildResult {
        let start = Instant::now();
        let rendered = command.join(" ");

        let Some((exe, args)) = command.split_first() else {
            let status = InvocationStatus::SpawnFailed {
                message: format!("{stage} command is empty"),
            };
            return self.finish(stage, &rendered, status, &[], &[], start);
        };

        info!(
            stage = %stage,
            command = %rendered,
            dir = %self.project_dir.display(),
            "Running toolchain step"
        );

        let spawned = Command::new(exe)
            .args(args)
            .current_dir(&self.project_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let status = InvocationStatus::SpawnFailed {
                    message: e.to_string(),
                };
                return self.finish(stage, &rendered, status, &[], &[], start);
            }
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let budget = Duration::from_millis(limits.timeout_ms);
        let collected = tokio::time::timeout(
            budget,
            collect(&mut child, &mut stdout, &mut stderr, limits.max_output_bytes),
        )
        .await;

        let status = match collected {
            Ok(Ok(exit)) => InvocationStatus::Exited { code: exit.code() },
            Ok(Err(CaptureError::Overflow(stream))) => {
                terminate(&mut child, stage).await;
                InvocationStatus::OutputLimitExceeded {
                    stream,
                    limit_bytes: limits.max_output_bytes,
                }
            }
            Ok(Err(CaptureError::Io(e))) => {
                terminate(&mut child, stage).await;
                InvocationStatus::SpawnFailed {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                terminate(&mut child, stage).await;
                InvocationStatus::TimedOut {
                    limit_ms: limits.timeout_ms,
                }
            }
        };

        self.finish(stage, &rendered, status, &stdout, &stderr, start)
    }
}

/// Drain both pipes (each capped at `cap` bytes), then reap the child.
async fn collect(
    child: &mut Child,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    cap: usize,
) -> Result<ExitStatus, CaptureError> {
    let out = child.stdout.take();
    let err = child.stderr.take();
    tokio::try_join!(
        read_capped(out, stdout, cap, OutputStream::Stdout),
        read_capped(err, stderr, cap, OutputStream::Stderr),
    )?;
    Ok(child.wait().await?)
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    buf: &mut Vec<u8>,
    cap: usize,
    stream: OutputStream,
) -> Result<(), CaptureError> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() + n > cap {
            let room = cap.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..room]);
            return Err(CaptureError::Overflow(stream));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn terminate(child: &mut Child, stage: ToolchainStage) {
    if let Err(e) = child.kill().await {
        debug!(stage = %stage, error = %e, "Toolchain process already gone");
    }
}
