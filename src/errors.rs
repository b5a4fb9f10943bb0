//! Typed error hierarchy for the Steadfast orchestrator.
//!
//! - `PlanIntegrityError`: malformed, cyclic or dangling plans (always fatal)
//! - `CheckpointError`: durable checkpoint read/write failures
//! - `RecoveryError`: attempt-log and escalation artifact failures
//! - `RateLimitExhausted`: throttling outlasted backoff (run pauses)
//! - `OrchestratorError`: top-level failures surfaced by `Orchestrator::run`

use std::path::PathBuf;
use thiserror::Error;

/// A plan whose structure cannot be scheduled. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanIntegrityError {
    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    Cycle { phases: Vec<String> },

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that id exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Duplicate subtask id '{subtask}' (phases '{first}' and '{second}')")]
    DuplicateSubtask {
        subtask: String,
        first: String,
        second: String,
    },

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),
}

/// Failures reading or persisting the checkpoint file.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse checkpoint at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write checkpoint at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Failures from the recovery manager.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Subtask {0} is escalated; clear its recovery state before recording new attempts")]
    AlreadyEscalated(String),

    #[error("Failed to load recovery state from {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to persist recovery state at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write escalation artifact for {subtask}: {source}")]
    ArtifactWrite {
        subtask: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Throttling was not lifted in time; dispatch cannot proceed.
///
/// Degraded rather than failed: subtasks that could not start stay `pending`
/// and the run pauses until an operator resumes it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitExhausted {
    #[error("Rate limit recovery exhausted its probes; manual resume required")]
    ManualResumeRequired,

    #[error("Dispatch stayed paused for {waited:?}, longer than the allowed maximum")]
    MaxPauseExceeded { waited: std::time::Duration },
}

/// Errors that abort an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Plan integrity error: {0}")]
    PlanIntegrity(#[from] PlanIntegrityError),

    #[error("Failed to persist plan at {path}: {source}")]
    PlanPersist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_integrity_cycle_lists_phases() {
        let err = PlanIntegrityError::Cycle {
            phases: vec!["P1".to_string(), "P2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("P1"));
        assert!(msg.contains("P2"));
    }

    #[test]
    fn plan_integrity_unknown_dependency_carries_names() {
        let err = PlanIntegrityError::UnknownDependency {
            phase: "P2".to_string(),
            dependency: "ghost".to_string(),
        };
        match &err {
            PlanIntegrityError::UnknownDependency { phase, dependency } => {
                assert_eq!(phase, "P2");
                assert_eq!(dependency, "ghost");
            }
            _ => panic!("Expected UnknownDependency"),
        }
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn orchestrator_error_converts_from_plan_integrity() {
        let inner = PlanIntegrityError::DuplicatePhase("P1".to_string());
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::PlanIntegrity(PlanIntegrityError::DuplicatePhase(id)) => {
                assert_eq!(id, "P1");
            }
            _ => panic!("Expected OrchestratorError::PlanIntegrity(DuplicatePhase(..))"),
        }
    }

    #[test]
    fn checkpoint_write_error_carries_path() {
        let path = PathBuf::from("/state/checkpoint.json");
        let err = CheckpointError::Write {
            path: path.clone(),
            source: anyhow::anyhow!("disk full"),
        };
        match &err {
            CheckpointError::Write { path: p, .. } => assert_eq!(p, &path),
            _ => panic!("Expected Write"),
        }
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlanIntegrityError::UnknownPhase("x".into()));
        assert_std_error(&RecoveryError::AlreadyEscalated("s1".into()));
        assert_std_error(&RateLimitExhausted::ManualResumeRequired);
        assert_std_error(&OrchestratorError::Other(anyhow::anyhow!("x")));
    }
}
