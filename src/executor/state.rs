//! Results and events produced while executing a plan.

use crate::backend::BackendKind;
use crate::dag::{BlockedPhase, DispatchMode};
use crate::plan::{Phase, SubtaskStatus};
use crate::rate_limit::RateLimitStatus;
use crate::recovery::EscalationReason;
use crate::util::duration_serde;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-phase aggregation, always in declared subtask order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub escalated: Vec<String>,
    /// Subtasks that never started because dispatch was aborted
    pub pending: Vec<String>,
    /// Dispatch stopped on `RateLimitExhausted`
    pub rate_limit_exhausted: bool,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PhaseResult {
    /// Aggregate the phase's current subtask statuses.
    pub fn from_phase(phase: &Phase, rate_limit_exhausted: bool, duration: Duration) -> Self {
        let ids = |status: SubtaskStatus| -> Vec<String> {
            phase
                .subtasks
                .iter()
                .filter(|s| s.status == status)
                .map(|s| s.id.clone())
                .collect()
        };

        Self {
            phase: phase.id.clone(),
            succeeded: ids(SubtaskStatus::Completed),
            failed: ids(SubtaskStatus::Failed),
            escalated: ids(SubtaskStatus::Escalated),
            pending: ids(SubtaskStatus::Pending),
            rate_limit_exhausted,
            duration,
        }
    }

    pub fn empty(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            escalated: Vec::new(),
            pending: Vec::new(),
            rate_limit_exhausted: false,
            duration: Duration::ZERO,
        }
    }

    /// Every subtask completed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.escalated.is_empty()
            && self.pending.is_empty()
            && !self.rate_limit_exhausted
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase resolved; the checkpoint was cleared
    Completed,
    /// Rate limiting outlasted backoff; resume later
    Paused {
        phase: String,
        pending: Vec<String>,
        manual_resume_required: bool,
    },
    /// Escalated subtasks block further progress
    Stopped {
        escalated: Vec<String>,
        blocked: Vec<BlockedPhase>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// State transitions emitted to an optional observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        phases: usize,
        force_refresh: bool,
    },
    PhaseStarted {
        phase: String,
        pending: usize,
        mode: DispatchMode,
    },
    SubtaskDispatched {
        phase: String,
        subtask: String,
        attempt: u32,
        backend: BackendKind,
    },
    SubtaskCompleted {
        phase: String,
        subtask: String,
        attempt: u32,
    },
    SubtaskFailed {
        phase: String,
        subtask: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    SubtaskRateLimited {
        phase: String,
        subtask: String,
        #[serde(with = "duration_serde")]
        retry_after: Duration,
    },
    SubtaskEscalated {
        phase: String,
        subtask: String,
        reason: EscalationReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<PathBuf>,
    },
    RateLimitChanged {
        from: RateLimitStatus,
        to: RateLimitStatus,
    },
    CheckpointWritten {
        phase: String,
        success: bool,
    },
    PhaseCompleted {
        result: Box<PhaseResult>,
    },
    RunFinished {
        run_id: String,
        outcome: RunOutcome,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_result_keeps_declared_order() {
        let mut phase = Phase::new("P1", "x", vec![], true)
            .with_subtask("c", "")
            .with_subtask("a", "")
            .with_subtask("b", "");
        phase.subtasks[0].status = SubtaskStatus::Completed;
        phase.subtasks[1].status = SubtaskStatus::Escalated;
        phase.subtasks[2].status = SubtaskStatus::Completed;

        let result = PhaseResult::from_phase(&phase, false, Duration::from_millis(5));
        assert_eq!(result.succeeded, vec!["c", "b"]);
        assert_eq!(result.escalated, vec!["a"]);
        assert!(!result.is_success());
    }

    #[test]
    fn test_event_serialization() {
        let event = OrchestratorEvent::SubtaskDispatched {
            phase: "P1".to_string(),
            subtask: "s1".to_string(),
            attempt: 2,
            backend: BackendKind::Fallback,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"subtask_dispatched\""));
        assert!(json.contains("\"backend\":\"fallback\""));
    }

    #[test]
    fn test_run_outcome_serialization() {
        let outcome = RunOutcome::Paused {
            phase: "P1".to_string(),
            pending: vec!["s4".to_string()],
            manual_resume_required: true,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"paused\""));
        let back: RunOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }
}
