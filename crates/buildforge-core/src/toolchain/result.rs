//! Toolchain invocation results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ToolchainStage;

/// Which captured stream a limit applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// How a toolchain invocation ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationStatus {
    /// The process exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },

    /// The wall-clock budget ran out and the process was killed.
    TimedOut { limit_ms: u64 },

    /// A stream produced more than the allowed number of bytes.
    OutputLimitExceeded {
        stream: OutputStream,
        limit_bytes: usize,
    },

    /// The process could not be started (or its pipes failed).
    SpawnFailed { message: String },
}

impl InvocationStatus {
    /// Only a clean zero exit counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationStatus::Exited { code: Some(0) })
    }

    /// Exit code, when the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            InvocationStatus::Exited { code } => *code,
            _ => None,
        }
    }

    fn describe(&self, command: &str) -> Option<String> {
        match self {
            InvocationStatus::Exited { code: Some(0) } => None,
            InvocationStatus::Exited { code: Some(code) } => {
                Some(format!("`{command}` exited with code {code}"))
            }
            InvocationStatus::Exited { code: None } => {
                Some(format!("`{command}` was terminated by a signal"))
            }
            InvocationStatus::TimedOut { limit_ms } => {
                Some(format!("`{command}` timed out after {limit_ms}ms"))
            }
            InvocationStatus::OutputLimitExceeded {
                stream,
                limit_bytes,
            } => Some(format!(
                "`{command}` exceeded the {limit_bytes} byte {stream} limit"
            )),
            InvocationStatus::SpawnFailed { message } => {
                Some(format!("failed to start `{command}`: {message}"))
            }
        }
    }
}

/// Outcome of one toolchain invocation.
///
/// `error` and `suggestion` are omitted from the serialized form when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildResult {
    /// Pipeline step this invocation belonged to.
    pub stage: ToolchainStage,

    /// Rendered command line.
    pub command: String,

    /// Whether the invocation succeeded (zero exit).
    pub success: bool,

    /// Tagged termination status.
    pub status: InvocationStatus,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// When the invocation finished.
    pub timestamp: DateTime<Utc>,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Best-effort hint for a recognised failure signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl BuildResult {
    pub fn new(
        stage: ToolchainStage,
        command: impl Into<String>,
        status: InvocationStatus,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        let command = command.into();
        let error = status.describe(&command);
        Self {
            stage,
            success: status.is_success(),
            command,
            status,
            stdout,
            stderr,
            timestamp: Utc::now(),
            duration_ms,
            error,
            suggestion: None,
        }
    }

    /// Attach a classification hint.
    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Exit code, if the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }
}
