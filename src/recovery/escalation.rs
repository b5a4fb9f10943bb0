//! Escalation artifacts handed to human review.

use super::AttemptRecord;
use crate::errors::RecoveryError;
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Why a subtask stopped being retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The attempt budget was spent
    AttemptsExhausted,
    /// The last attempts failed with the same error
    RecurringFailure,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::AttemptsExhausted => write!(f, "attempt budget exhausted"),
            EscalationReason::RecurringFailure => write!(f, "recurring failure"),
        }
    }
}

/// Human-readable record of an escalated subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub subtask_id: String,
    pub reason: EscalationReason,
    pub max_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    /// Where the Markdown artifact was written, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

impl EscalationReport {
    pub fn new(
        subtask_id: &str,
        reason: EscalationReason,
        max_attempts: u32,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            subtask_id: subtask_id.to_string(),
            reason,
            max_attempts,
            attempts,
            created_at: Utc::now(),
            artifact: None,
        }
    }

    /// Error summary of the most recent failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .filter(|a| !a.success)
            .find_map(|a| a.error.as_deref())
    }

    /// Suggested next step for the reviewer.
    pub fn recommended_action(&self) -> &'static str {
        let timed_out = self
            .last_error()
            .map(|e| {
                let e = e.to_lowercase();
                e.contains("timed out") || e.contains("timeout")
            })
            .unwrap_or(false);

        if self.reason == EscalationReason::RecurringFailure {
            "The same error repeated across attempts, so retrying unchanged will not help. \
             Fix the underlying cause or rewrite the subtask description, then clear its \
             recovery state and resume."
        } else if timed_out {
            "The backend ran out of time. Split the subtask into smaller pieces or raise \
             `backend.timeout_secs`, then clear its recovery state and resume."
        } else {
            "Inspect the attempt history below, resolve the failure manually or adjust the \
             subtask, then clear its recovery state and resume."
        }
    }

    /// Render the artifact body.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Escalation: {}\n\n", self.subtask_id));
        out.push_str(&format!("- **Reason:** {}\n", self.reason));
        out.push_str(&format!(
            "- **Attempts:** {} of {}\n",
            self.attempts.len(),
            self.max_attempts
        ));
        out.push_str(&format!("- **Escalated at:** {}\n\n", self.created_at.to_rfc3339()));

        out.push_str("## Last error\n\n");
        match self.last_error() {
            Some(error) => out.push_str(&format!("```\n{}\n```\n\n", error.trim_end())),
            None => out.push_str("_No error summary was recorded._\n\n"),
        }

        out.push_str("## Attempt history\n\n");
        out.push_str("| # | Time | Result | Error |\n");
        out.push_str("|---|------|--------|-------|\n");
        for (i, attempt) in self.attempts.iter().enumerate() {
            let error = attempt
                .error
                .as_deref()
                .map(|e| e.lines().next().unwrap_or("").replace('|', "\\|"))
                .unwrap_or_default();
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                i + 1,
                attempt.timestamp.to_rfc3339(),
                if attempt.success { "success" } else { "failed" },
                error
            ));
        }

        out.push_str("\n## Recommended action\n\n");
        out.push_str(self.recommended_action());
        out.push('\n');
        out
    }

    /// Write the artifact as `<dir>/<subtask>.md` and remember its path.
    pub fn write_to(&mut self, dir: &Path) -> Result<PathBuf, RecoveryError> {
        let path = dir.join(format!("{}.md", artifact_stem(&self.subtask_id)));
        write_atomic(&path, self.to_markdown().as_bytes()).map_err(|source| {
            RecoveryError::ArtifactWrite {
                subtask: self.subtask_id.clone(),
                source,
            }
        })?;
        self.artifact = Some(path.clone());
        Ok(path)
    }
}

/// File-name-safe form of a subtask id.
fn artifact_stem(subtask_id: &str) -> String {
    subtask_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
