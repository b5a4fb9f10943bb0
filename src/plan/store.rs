//! Loading and atomically persisting the plan document.

use super::model::Plan;
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Durable location of the plan document (`plan.json`).
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load, link and validate the plan.
    ///
    /// Structural problems surface as a `PlanIntegrityError` inside the
    /// returned error and can be recovered with `downcast_ref`.
    pub fn load(&self) -> Result<Plan> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read plan file: {}", self.path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid plan file: {}", self.path.display()))
    }

    /// Parse and validate a plan document.
    pub fn parse(content: &str) -> Result<Plan> {
        let mut plan: Plan = serde_json::from_str(content).context("Failed to parse plan JSON")?;
        plan.link_subtasks();
        plan.validate()?;
        Ok(plan)
    }

    /// Write the plan with temp-file-then-rename semantics.
    pub fn save(&self, plan: &Plan) -> Result<()> {
        write_json_atomic(&self.path, plan)
            .with_context(|| format!("Failed to write plan file: {}", self.path.display()))
    }
}
