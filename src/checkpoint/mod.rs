//! Durable phase-completion record used to resume interrupted runs.
//!
//! The checkpoint file is the only state consulted to decide whether a phase
//! may be skipped on restart:
//!
//! ```json
//! {
//!   "version": 1,
//!   "started_at": "2026-01-01T00:00:00Z",
//!   "last_updated": "2026-01-01T00:10:00Z",
//!   "model_fingerprint": "3f2a9c01d4e7",
//!   "completed_phases": [
//!     {"phase": "P1", "success": true, "completed_at": "...", "output_refs": []}
//!   ]
//! }
//! ```

mod store;

pub use store::CheckpointStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Format version written into every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Completion entry for one phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseCheckpoint {
    pub phase: String,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub output_refs: Vec<String>,
}

/// Versioned, timestamped record of resolved phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub model_fingerprint: String,
    #[serde(default)]
    pub completed_phases: Vec<PhaseCheckpoint>,
}

impl Checkpoint {
    /// Create an empty checkpoint for the given fingerprint.
    pub fn new(fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            started_at: now,
            last_updated: now,
            model_fingerprint: fingerprint.to_string(),
            completed_phases: Vec::new(),
        }
    }

    /// Replace any prior entry for the phase with a fresh one.
    pub fn upsert(
        &mut self,
        phase: &str,
        success: bool,
        output_refs: Vec<String>,
        completed_at: DateTime<Utc>,
    ) {
        self.completed_phases.retain(|entry| entry.phase != phase);
        self.completed_phases.push(PhaseCheckpoint {
            phase: phase.to_string(),
            success,
            completed_at,
            output_refs,
        });
        self.last_updated = completed_at;
    }

    pub fn entry(&self, phase: &str) -> Option<&PhaseCheckpoint> {
        self.completed_phases.iter().find(|entry| entry.phase == phase)
    }

    /// True only if the phase has an entry with `success = true`.
    pub fn is_phase_complete(&self, phase: &str) -> bool {
        self.entry(phase).is_some_and(|entry| entry.success)
    }

    pub fn is_empty(&self) -> bool {
        self.completed_phases.is_empty()
    }

    /// Whether this checkpoint may be reused by a run with `fingerprint`.
    pub fn matches(&self, fingerprint: &str) -> bool {
        self.version == CHECKPOINT_VERSION && self.model_fingerprint == fingerprint
    }
}

/// Compute a short fingerprint over the settings that shape phase results.
///
/// Returns the first 12 hex characters of a SHA-256 over the parts.
pub fn compute_fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        // Separator so ["ab", "c"] and ["a", "bc"] differ
        hasher.update([0u8]);
    }
    let result = hasher.finalize();
    format!("{:x}", result)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_prior_entry() {
        let mut checkpoint = Checkpoint::new("fp");
        checkpoint.upsert("P1", false, vec![], Utc::now());
        checkpoint.upsert("P1", true, vec!["out.txt".to_string()], Utc::now());

        assert_eq!(checkpoint.completed_phases.len(), 1);
        assert!(checkpoint.is_phase_complete("P1"));
        assert_eq!(checkpoint.entry("P1").unwrap().output_refs, vec!["out.txt"]);
    }

    #[test]
    fn test_failed_entry_is_not_complete() {
        let mut checkpoint = Checkpoint::new("fp");
        checkpoint.upsert("P1", false, vec![], Utc::now());
        assert!(!checkpoint.is_phase_complete("P1"));
        assert!(!checkpoint.is_phase_complete("P2"));
    }

    #[test]
    fn test_matches_requires_same_fingerprint_and_version() {
        let mut checkpoint = Checkpoint::new("abc");
        assert!(checkpoint.matches("abc"));
        assert!(!checkpoint.matches("def"));

        checkpoint.version = CHECKPOINT_VERSION + 1;
        assert!(!checkpoint.matches("abc"));
    }

    #[test]
    fn test_compute_fingerprint_is_stable_and_short() {
        let a = compute_fingerprint(&["cmd", "3"]);
        let b = compute_fingerprint(&["cmd", "3"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_fingerprint_separates_parts() {
        assert_ne!(compute_fingerprint(&["ab", "c"]), compute_fingerprint(&["a", "bc"]));
    }
}
