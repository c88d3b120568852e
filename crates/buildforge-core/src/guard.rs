//! Single-flight guard for the build/package/archive pipeline.
//!
//! The staging directory and the canonical archive are shared by every
//! pipeline run, so at most one run may hold the guard at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::PipelineError;

/// Behaviour when the guard is already held.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Fail fast with [`PipelineError::BuildInProgress`].
    #[default]
    Reject,
    /// Wait (FIFO) until the running pipeline finishes.
    Queue,
}

/// Cloneable handle to the pipeline's single-flight lock.
#[derive(Debug, Clone, Default)]
pub struct PipelineGuard {
    lock: Arc<Mutex<()>>,
}

/// Proof of exclusive access; released on drop.
#[derive(Debug)]
pub struct PipelinePermit {
    _guard: OwnedMutexGuard<()>,
}

impl PipelineGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard according to `policy`.
    pub async fn acquire(&self, policy: ConcurrencyPolicy) -> Result<PipelinePermit, PipelineError> {
        match policy {
            ConcurrencyPolicy::Reject => {
                let guard = Arc::clone(&self.lock).try_lock_owned().map_err(|_| {
                    debug!("Pipeline busy, rejecting request");
                    PipelineError::BuildInProgress
                })?;
                Ok(PipelinePermit { _guard: guard })
            }
            ConcurrencyPolicy::Queue => {
                if self.is_busy() {
                    debug!("Pipeline busy, queueing request");
                }
                let guard = Arc::clone(&self.lock).lock_owned().await;
                Ok(PipelinePermit { _guard: guard })
            }
        }
    }

    /// Whether a pipeline run currently holds the guard.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
