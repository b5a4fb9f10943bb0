//! Shell-command backend and health probe.
//!
//! Each attempt spawns `sh -c <command>` in the project directory:
//! - Subtask and context are passed as JSON on stdin
//! - `STEADFAST_SUBTASK_ID`, `STEADFAST_PHASE_ID`, `STEADFAST_ATTEMPT` and
//!   `STEADFAST_BACKEND` are set in the environment
//! - Exit 0 = success, exit 75 (EX_TEMPFAIL) = throttled, other = failure
//! - A JSON object on stdout may carry `output_refs`, `retry_after_secs`
//!   and `error`

use super::{BackendError, BackendKind, DispatchContext, DispatchOutput, ExecutionBackend, HealthProbe};
use crate::plan::Subtask;
use crate::util::extract_json_object;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code a command uses to signal throttling.
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Serialize)]
struct DispatchRequest<'a> {
    subtask: &'a Subtask,
    phase_id: &'a str,
    context: &'a DispatchContext,
}

#[derive(Debug, Default, Deserialize)]
struct CommandReport {
    #[serde(default)]
    output_refs: Vec<String>,
    #[serde(default)]
    retry_after_secs: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs every attempt as a shell command.
pub struct CommandBackend {
    name: String,
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
    kind: BackendKind,
}

impl CommandBackend {
    pub fn new(
        command: impl Into<String>,
        working_dir: impl AsRef<Path>,
        timeout: Duration,
        kind: BackendKind,
    ) -> Self {
        let command = command.into();
        Self {
            name: format!("{} ({})", kind, command),
            command,
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout,
            kind,
        }
    }

    fn parse_result(&self, output: &std::process::Output) -> Result<DispatchOutput, BackendError> {
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let report = extract_json_object(&stdout)
            .and_then(|json| serde_json::from_str::<CommandReport>(&json).ok())
            .unwrap_or_default();

        if exit_code == 0 {
            return Ok(DispatchOutput {
                output: stdout.trim().to_string(),
                output_refs: report.output_refs,
            });
        }

        let message = report
            .error
            .or_else(|| Some(stderr.trim().to_string()).filter(|s| !s.is_empty()))
            .or_else(|| Some(stdout.trim().to_string()).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| format!("Backend command exited with code {}", exit_code));

        let mut error = BackendError::new(message);
        if exit_code == EXIT_TEMPFAIL {
            error = error.with_status(429);
        }
        if let Some(secs) = report.retry_after_secs {
            error = error.with_retry_after(Duration::from_secs(secs));
        }
        Err(error)
    }
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        subtask: &Subtask,
        ctx: &DispatchContext,
    ) -> Result<DispatchOutput, BackendError> {
        let request = DispatchRequest {
            subtask,
            phase_id: &ctx.phase_id,
            context: ctx,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| BackendError::new(format!("Failed to serialize dispatch request: {}", e)))?;

        tracing::debug!(
            subtask = %subtask.id,
            backend = %self.kind,
            attempt = ctx.attempt,
            command = %self.command,
            "Spawning backend command"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("STEADFAST_SUBTASK_ID", &subtask.id)
            .env("STEADFAST_PHASE_ID", &ctx.phase_id)
            .env("STEADFAST_ATTEMPT", ctx.attempt.to_string())
            .env("STEADFAST_BACKEND", self.kind.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::new(format!("Failed to spawn backend command: {}", e)))?;

        // Writing the request counts against the timeout too: a command that
        // never reads stdin would otherwise block a large write until it exits.
        let subtask_id = &subtask.id;
        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A command that ignores stdin may close it early
                if let Err(e) = stdin.write_all(request_json.as_bytes()).await {
                    tracing::debug!(subtask = %subtask_id, error = %e, "Backend command closed stdin");
                }
            }
            child.wait_with_output().await
        };

        // On timeout the child is dropped and killed
        let output = match timeout(self.timeout, run).await {
            Ok(result) => result
                .map_err(|e| BackendError::new(format!("Failed to wait for backend command: {}", e)))?,
            Err(_) => return Err(BackendError::timeout(self.timeout)),
        };

        self.parse_result(&output)
    }
}

/// Health check that runs a shell command; exit 0 means available.
pub struct CommandProbe {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn is_available(&self) -> bool {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match timeout(self.timeout, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(command = %self.command, error = %e, "Health probe failed to run");
                false
            }
            Err(_) => {
                tracing::debug!(command = %self.command, "Health probe timed out");
                false
            }
        }
    }
}
