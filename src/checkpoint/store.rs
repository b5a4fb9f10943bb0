use super::Checkpoint;
use crate::errors::CheckpointError;
use crate::util::write_json_atomic;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Owns the checkpoint file for one state directory.
///
/// The in-memory copy is authoritative for the current run. Every mutation
/// rewrites the whole file, so a write that failed earlier is repaired by the
/// next successful one.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    fingerprint: String,
    current: Checkpoint,
    /// Checkpoint thrown away by the last `load` for a fingerprint mismatch
    discarded: Option<Checkpoint>,
    dirty: bool,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, fingerprint: &str) -> Self {
        Self {
            path: path.into(),
            fingerprint: fingerprint.to_string(),
            current: Checkpoint::new(fingerprint),
            discarded: None,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Read the raw file without fingerprint checks.
    pub fn read(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| CheckpointError::Read {
            path: self.path.clone(),
            source,
        })?;
        let checkpoint = serde_json::from_str(&content).map_err(|source| CheckpointError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(checkpoint))
    }

    /// Load the durable checkpoint if it belongs to the current configuration.
    ///
    /// A missing, unreadable or stale file yields an empty checkpoint. A
    /// stale one is kept aside in [`discarded`](Self::discarded) so the
    /// caller can invalidate the results it vouched for.
    pub fn load(&mut self) -> &Checkpoint {
        self.discarded = None;
        self.current = match self.read() {
            Ok(Some(checkpoint)) if checkpoint.matches(&self.fingerprint) => {
                tracing::info!(
                    path = %self.path.display(),
                    phases = checkpoint.completed_phases.len(),
                    "Loaded checkpoint"
                );
                checkpoint
            }
            Ok(Some(checkpoint)) => {
                tracing::warn!(
                    path = %self.path.display(),
                    stored = %checkpoint.model_fingerprint,
                    current = %self.fingerprint,
                    version = checkpoint.version,
                    "Checkpoint belongs to a different configuration, ignoring it"
                );
                self.discarded = Some(checkpoint);
                Checkpoint::new(&self.fingerprint)
            }
            Ok(None) => Checkpoint::new(&self.fingerprint),
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable checkpoint, starting empty");
                Checkpoint::new(&self.fingerprint)
            }
        };
        self.dirty = false;
        &self.current
    }

    /// Upsert the phase entry and persist atomically.
    ///
    /// On a write failure the entry stays in memory and the store is marked
    /// dirty; the next call (or [`flush`](Self::flush)) rewrites it.
    pub fn mark_phase_complete(
        &mut self,
        phase_id: &str,
        success: bool,
        output_refs: Vec<String>,
    ) -> Result<(), CheckpointError> {
        self.current.upsert(phase_id, success, output_refs, Utc::now());
        self.dirty = true;
        tracing::debug!(phase = %phase_id, success, "Checkpoint entry updated");
        self.persist()
    }

    /// Retry a previously failed write, if any.
    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        if self.dirty {
            self.persist()
        } else {
            Ok(())
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_phase_complete(&self, phase_id: &str) -> bool {
        self.current.is_phase_complete(phase_id)
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.current
    }

    /// The stale checkpoint the last `load` ignored, if any.
    pub fn discarded(&self) -> Option<&Checkpoint> {
        self.discarded.as_ref()
    }

    /// Remove the checkpoint file and reset the in-memory copy.
    pub fn clear(&mut self) -> Result<(), CheckpointError> {
        self.current = Checkpoint::new(&self.fingerprint);
        self.discarded = None;
        self.dirty = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Write {
                path: self.path.clone(),
                source: e.into(),
            }),
        }
    }

    fn persist(&mut self) -> Result<(), CheckpointError> {
        write_json_atomic(&self.path, &self.current).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}
