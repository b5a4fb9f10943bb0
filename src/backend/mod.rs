//! Execution backend boundary.
//!
//! The orchestrator never knows what a subtask actually does. It hands the
//! subtask to an [`ExecutionBackend`] and interprets the result:
//!
//! - `Ok(DispatchOutput)`: the attempt succeeded
//! - `Err(BackendError)`: the attempt failed; the rate-limit classifier
//!   decides whether it was throttling or a real failure
//!
//! A [`HealthProbe`] answers whether a backend is reachable again while the
//! rate-limit controller is paused or routing to the fallback.

mod command;
#[cfg(test)]
pub mod mock;

pub use command::{CommandBackend, CommandProbe};

use crate::plan::Subtask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which backend a dispatch is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Primary,
    Fallback,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Primary => write!(f, "primary"),
            BackendKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Per-dispatch context handed to the backend alongside the subtask.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchContext {
    pub phase_id: String,
    pub phase_name: String,
    /// 1-based attempt number this dispatch will be recorded as
    pub attempt: u32,
    pub backend: BackendKind,
    /// Error summary of the previous failed attempt, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<String>,
}

/// Successful result of one attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutput {
    pub output: String,
    pub output_refs: Vec<String>,
}

/// A failed attempt as reported by the backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Status signal, e.g. 429 for throttling
    pub status_code: Option<u16>,
    /// Retry-after hint supplied by the backend
    pub retry_after: Option<Duration>,
    /// The attempt hit the backend timeout
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            retry_after: None,
            timed_out: false,
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("Backend timed out after {} seconds", after.as_secs()),
            status_code: None,
            retry_after: None,
            timed_out: true,
        }
    }
}

/// Runs one attempt of a subtask. Must be safe to call concurrently.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        subtask: &Subtask,
        ctx: &DispatchContext,
    ) -> Result<DispatchOutput, BackendError>;
}

/// Reachability check for a backend.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_available(&self) -> bool;
}

/// Probe with a fixed answer, for backends that have no health check.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn is_available(&self) -> bool {
        self.0
    }
}
