//! Per-subtask retry accounting and escalation.
//!
//! The [`RecoveryManager`] keeps an append-only attempt log per subtask. The
//! executor asks it whether a failed subtask may be re-enqueued
//! ([`RecoveryManager::can_retry`], [`RecoveryManager::recovery_context`]) and
//! reports every finished dispatch back through
//! [`RecoveryManager::record_attempt`]. Rate-limit signals are never recorded
//! here, so throttling does not spend a subtask's budget.
//!
//! When backed by a file (`recovery.json`), the log survives restarts, which
//! keeps a crash from handing a subtask a fresh budget.

mod escalation;
mod similarity;

pub use escalation::{EscalationReason, EscalationReport};
pub use similarity::error_similarity;

use crate::errors::RecoveryError;
use crate::util::write_json_atomic;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Default similarity score at which two errors count as the same failure.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

/// One execution attempt of a subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-only snapshot the executor uses to decide on re-enqueueing.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryContext {
    pub attempts: Vec<AttemptRecord>,
    pub attempt_count: u32,
    pub can_retry: bool,
    /// The last two attempts failed with near-identical errors
    pub escalation_recommended: bool,
}

/// What `record_attempt` did.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Attempt count after this record
    pub attempt: u32,
    /// Set when this attempt spent the last of the budget
    pub escalation: Option<EscalationReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecoveryLog {
    #[serde(default)]
    attempts: BTreeMap<String, Vec<AttemptRecord>>,
    #[serde(default)]
    escalated: BTreeSet<String>,
}

/// Tracks attempts and escalation for every subtask of a run.
#[derive(Debug)]
pub struct RecoveryManager {
    max_attempts: u32,
    similarity_threshold: f64,
    log: RecoveryLog,
    store_path: Option<PathBuf>,
    escalation_dir: Option<PathBuf>,
}

impl RecoveryManager {
    /// Create an in-memory manager. `max_attempts` is always caller-supplied.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            log: RecoveryLog::default(),
            store_path: None,
            escalation_dir: None,
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Persist the attempt log to `path` after every change.
    pub fn with_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Write escalation artifacts into `dir`.
    pub fn with_escalation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.escalation_dir = Some(dir.into());
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Reload the attempt log from the backing file, if there is one.
    pub fn load(&mut self) -> Result<(), RecoveryError> {
        let Some(path) = self.store_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let log = std::fs::read_to_string(&path)
            .context("Failed to read recovery file")
            .and_then(|content| {
                serde_json::from_str::<RecoveryLog>(&content).context("Failed to parse recovery file")
            })
            .map_err(|source| RecoveryError::Load {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %path.display(),
            subtasks = log.attempts.len(),
            escalated = log.escalated.len(),
            "Loaded recovery state"
        );
        self.log = log;
        Ok(())
    }

    /// Write the attempt log to the backing file, if there is one.
    pub fn save(&self) -> Result<(), RecoveryError> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        write_json_atomic(path, &self.log).map_err(|source| RecoveryError::Persist {
            path: path.clone(),
            source,
        })
    }

    pub fn attempts(&self, subtask_id: &str) -> &[AttemptRecord] {
        self.log
            .attempts
            .get(subtask_id)
            .map_or(&[], |records| records.as_slice())
    }

    pub fn attempt_count(&self, subtask_id: &str) -> u32 {
        self.attempts(subtask_id).len() as u32
    }

    pub fn is_escalated(&self, subtask_id: &str) -> bool {
        self.log.escalated.contains(subtask_id)
    }

    /// True iff the subtask is not escalated and has budget left.
    pub fn can_retry(&self, subtask_id: &str) -> bool {
        !self.is_escalated(subtask_id) && self.attempt_count(subtask_id) < self.max_attempts
    }

    /// Append an attempt and escalate when a failure spends the last of the
    /// budget.
    pub fn record_attempt(
        &mut self,
        subtask_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<AttemptOutcome, RecoveryError> {
        if self.is_escalated(subtask_id) {
            return Err(RecoveryError::AlreadyEscalated(subtask_id.to_string()));
        }

        self.log
            .attempts
            .entry(subtask_id.to_string())
            .or_default()
            .push(AttemptRecord {
                timestamp: Utc::now(),
                success,
                error: error.map(String::from),
            });
        let attempt = self.attempt_count(subtask_id);

        tracing::debug!(subtask = %subtask_id, attempt, success, "Recorded attempt");

        let escalation = if !success && attempt >= self.max_attempts {
            Some(self.mark_escalated(subtask_id, EscalationReason::AttemptsExhausted))
        } else {
            self.persist_or_warn();
            None
        };

        Ok(AttemptOutcome {
            attempt,
            escalation,
        })
    }

    pub fn recovery_context(&self, subtask_id: &str) -> RecoveryContext {
        let attempts = self.attempts(subtask_id).to_vec();
        RecoveryContext {
            attempt_count: attempts.len() as u32,
            can_retry: self.can_retry(subtask_id),
            escalation_recommended: self.is_recurring(&attempts),
            attempts,
        }
    }

    /// Escalate ahead of the budget, e.g. on a recurring failure or when a
    /// budget was already spent under an earlier configuration.
    pub fn escalate(&mut self, subtask_id: &str, reason: EscalationReason) -> EscalationReport {
        self.mark_escalated(subtask_id, reason)
    }

    /// Operator reset of one subtask's history.
    pub fn clear(&mut self, subtask_id: &str) -> Result<(), RecoveryError> {
        self.log.attempts.remove(subtask_id);
        self.log.escalated.remove(subtask_id);
        self.save()
    }

    /// Operator reset of every subtask's history.
    pub fn clear_all(&mut self) -> Result<(), RecoveryError> {
        self.log = RecoveryLog::default();
        self.save()
    }

    /// Escalated subtask ids, sorted.
    pub fn escalated(&self) -> Vec<String> {
        self.log.escalated.iter().cloned().collect()
    }

    fn is_recurring(&self, attempts: &[AttemptRecord]) -> bool {
        let [.., prev, last] = attempts else {
            return false;
        };
        if prev.success || last.success {
            return false;
        }
        match (&prev.error, &last.error) {
            (Some(a), Some(b)) => error_similarity(a, b) >= self.similarity_threshold,
            _ => false,
        }
    }

    fn mark_escalated(&mut self, subtask_id: &str, reason: EscalationReason) -> EscalationReport {
        self.log.escalated.insert(subtask_id.to_string());
        self.persist_or_warn();

        let mut report = EscalationReport::new(
            subtask_id,
            reason,
            self.max_attempts,
            self.attempts(subtask_id).to_vec(),
        );

        if let Some(dir) = &self.escalation_dir {
            match report.write_to(dir) {
                Ok(path) => {
                    tracing::warn!(
                        subtask = %subtask_id,
                        reason = %reason,
                        artifact = %path.display(),
                        "Subtask escalated"
                    );
                }
                Err(e) => {
                    tracing::error!(subtask = %subtask_id, error = %e, "Subtask escalated but artifact write failed");
                }
            }
        } else {
            tracing::warn!(subtask = %subtask_id, reason = %reason, "Subtask escalated");
        }

        report
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "Recovery state not persisted; will retry on next change");
        }
    }

    /// Backing file, if any.
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_can_retry_until_budget_spent() {
        let mut manager = RecoveryManager::new(2);
        assert!(manager.can_retry("s1"));

        let outcome = manager.record_attempt("s1", false, Some("tests failed")).unwrap();
        assert_eq!(outcome.attempt, 1);
        assert!(outcome.escalation.is_none());
        assert!(manager.can_retry("s1"));

        let outcome = manager.record_attempt("s1", false, Some("linker error")).unwrap();
        assert_eq!(outcome.attempt, 2);
        assert!(outcome.escalation.is_some());
        assert!(!manager.can_retry("s1"));
        assert!(manager.is_escalated("s1"));
    }

    #[test]
    fn test_attempt_count_increments_by_one() {
        let mut manager = RecoveryManager::new(5);
        for expected in 1..=4 {
            let before = manager.attempt_count("s1");
            manager.record_attempt("s1", false, Some("x")).unwrap();
            assert_eq!(manager.attempt_count("s1"), before + 1);
            assert_eq!(manager.attempt_count("s1"), expected);
        }
    }

    #[test]
    fn test_record_after_escalation_is_rejected() {
        let mut manager = RecoveryManager::new(1);
        manager.record_attempt("s1", false, Some("boom")).unwrap();
        let err = manager.record_attempt("s1", false, Some("boom")).unwrap_err();
        assert!(matches!(err, RecoveryError::AlreadyEscalated(ref id) if id == "s1"));
        assert_eq!(manager.attempt_count("s1"), 1);
    }

    #[test]
    fn test_success_at_budget_does_not_escalate() {
        let mut manager = RecoveryManager::new(2);
        manager.record_attempt("s1", false, Some("flaky")).unwrap();
        let outcome = manager.record_attempt("s1", true, None).unwrap();
        assert!(outcome.escalation.is_none());
        assert!(!manager.is_escalated("s1"));
    }

    #[test]
    fn test_recurring_failure_recommends_escalation() {
        let mut manager = RecoveryManager::new(5);
        manager
            .record_attempt("s1", false, Some("error: cannot find value `x` at line 10"))
            .unwrap();
        assert!(!manager.recovery_context("s1").escalation_recommended);

        manager
            .record_attempt("s1", false, Some("error: cannot find value `x` at line 12"))
            .unwrap();
        let ctx = manager.recovery_context("s1");
        assert!(ctx.escalation_recommended);
        assert!(ctx.can_retry);
        assert_eq!(ctx.attempt_count, 2);
    }

    #[test]
    fn test_different_failures_do_not_recommend_escalation() {
        let mut manager = RecoveryManager::new(5);
        manager.record_attempt("s1", false, Some("compile error in parser")).unwrap();
        manager.record_attempt("s1", false, Some("network unreachable")).unwrap();
        assert!(!manager.recovery_context("s1").escalation_recommended);
    }

    #[test]
    fn test_escalation_writes_artifact() {
        let dir = tempdir().unwrap();
        let mut manager = RecoveryManager::new(1).with_escalation_dir(dir.path().join("escalations"));
        let outcome = manager.record_attempt("s1", false, Some("boom")).unwrap();

        let report = outcome.escalation.unwrap();
        let artifact = report.artifact.unwrap();
        assert!(artifact.ends_with("escalations/s1.md"));
        let content = std::fs::read_to_string(artifact).unwrap();
        assert!(content.contains("boom"));
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.json");
        {
            let mut manager = RecoveryManager::new(3).with_store(&path);
            manager.record_attempt("s1", false, Some("boom")).unwrap();
            manager.record_attempt("s2", false, Some("boom")).unwrap();
            manager.record_attempt("s2", false, Some("boom")).unwrap();
            manager.record_attempt("s2", false, Some("boom")).unwrap();
        }

        let mut restarted = RecoveryManager::new(3).with_store(&path);
        restarted.load().unwrap();
        assert_eq!(restarted.attempt_count("s1"), 1);
        assert!(restarted.can_retry("s1"));
        assert!(restarted.is_escalated("s2"));
        assert!(!restarted.can_retry("s2"));
    }

    #[test]
    fn test_clear_resets_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.json");
        let mut manager = RecoveryManager::new(1).with_store(&path);
        manager.record_attempt("s1", false, Some("boom")).unwrap();
        manager.record_attempt("s2", true, None).unwrap();

        manager.clear("s1").unwrap();
        assert_eq!(manager.attempt_count("s1"), 0);
        assert!(manager.can_retry("s1"));
        assert_eq!(manager.attempt_count("s2"), 1);

        manager.clear_all().unwrap();
        let mut reloaded = RecoveryManager::new(1).with_store(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.attempt_count("s2"), 0);
    }

    #[test]
    fn test_corrupt_store_is_load_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.json");
        std::fs::write(&path, "nope").unwrap();
        let mut manager = RecoveryManager::new(3).with_store(&path);
        assert!(matches!(manager.load(), Err(RecoveryError::Load { .. })));
    }

    #[test]
    fn test_lowered_budget_blocks_retry() {
        let mut manager = RecoveryManager::new(5);
        manager.record_attempt("s1", false, Some("a")).unwrap();
        manager.record_attempt("s1", false, Some("b")).unwrap();

        let mut stricter = RecoveryManager::new(2);
        stricter.log = manager.log.clone();
        assert!(!stricter.can_retry("s1"));
        assert!(!stricter.is_escalated("s1"));

        let report = stricter.escalate("s1", EscalationReason::AttemptsExhausted);
        assert_eq!(report.attempts.len(), 2);
        assert!(stricter.is_escalated("s1"));
    }
}
