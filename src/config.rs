//! Configuration for steadfast.
//!
//! Settings are read from `.steadfast/steadfast.toml` and layered
//! file → environment → CLI. Every section is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [executor]
//! max_parallel = 5
//! max_pause_secs = 1800
//!
//! [recovery]
//! max_attempts = 3
//! similarity_threshold = 0.8
//!
//! [rate_limit]
//! default_wait_secs = 60
//! max_wait_secs = 600
//! backoff_multiplier = 2.0
//! max_retries = 5
//!
//! [backend]
//! command = "./scripts/work.sh"
//! fallback_command = "./scripts/work-fallback.sh"
//! health_command = "./scripts/health.sh"
//! timeout_secs = 900
//!
//! [checkpoint]
//! fingerprint = "model-x@2"
//! ```

use crate::checkpoint::{CheckpointStore, compute_fingerprint};
use crate::executor::ExecutorConfig;
use crate::plan::PlanStore;
use crate::rate_limit::{RateLimitClassifier, RateLimitConfig};
use crate::recovery::{DEFAULT_SIMILARITY_THRESHOLD, RecoveryManager};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the state directory inside the project.
pub const STATE_DIR: &str = ".steadfast";

/// Overrides the primary backend command.
pub const ENV_BACKEND_CMD: &str = "STEADFAST_BACKEND_CMD";
/// Overrides `executor.max_parallel`.
pub const ENV_MAX_PARALLEL: &str = "STEADFAST_MAX_PARALLEL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Bound on in-flight dispatches
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_pause_secs")]
    pub max_pause_secs: u64,
}

fn default_max_parallel() -> usize {
    5
}

fn default_max_pause_secs() -> u64 {
    1800
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_pause_secs: default_max_pause_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Error similarity at or above which two failures count as the same
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Wait used when a throttling error carries no hint
    #[serde(default = "default_wait_secs")]
    pub default_wait_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_wait_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    600
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_wait_secs: default_wait_secs(),
            max_wait_secs: default_max_wait_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    /// Shell command run for every attempt
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub fallback_command: Option<String>,
    /// Exit 0 means the primary backend is usable again
    #[serde(default)]
    pub health_command: Option<String>,
    #[serde(default)]
    pub fallback_health_command: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    900
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            command: None,
            fallback_command: None,
            health_command: None,
            fallback_health_command: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointSection {
    /// Explicit model/settings fingerprint; derived from the backend
    /// settings when unset
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Root of `steadfast.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SteadfastToml {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
}

impl SteadfastToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse steadfast.toml")
    }

    /// Load `<state_dir>/steadfast.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("steadfast.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup(ENV_BACKEND_CMD).filter(|c| !c.trim().is_empty()) {
            self.backend.command = Some(cmd);
        }
        if let Some(raw) = lookup(ENV_MAX_PARALLEL) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.executor.max_parallel = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_MAX_PARALLEL),
            }
        }
    }

    /// Problems that do not stop loading but deserve a warning.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.executor.max_parallel == 0 {
            warnings.push("executor.max_parallel is 0; using 1".to_string());
        }
        if self.recovery.max_attempts == 0 {
            warnings.push("recovery.max_attempts is 0; using 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.recovery.similarity_threshold) {
            warnings.push(format!(
                "recovery.similarity_threshold {} is outside 0.0..=1.0",
                self.recovery.similarity_threshold
            ));
        }
        if !self.rate_limit.backoff_multiplier.is_finite() || self.rate_limit.backoff_multiplier > 100.0 {
            warnings.push(format!(
                "rate_limit.backoff_multiplier {} is out of range; waits will jump straight to max_wait_secs",
                self.rate_limit.backoff_multiplier
            ));
        } else if self.rate_limit.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "rate_limit.backoff_multiplier {} is below 1.0; backoff will not grow",
                self.rate_limit.backoff_multiplier
            ));
        }
        if self.rate_limit.default_wait_secs > self.rate_limit.max_wait_secs {
            warnings.push("rate_limit.default_wait_secs exceeds max_wait_secs; it will be capped".to_string());
        }
        if self.backend.fallback_health_command.is_some() && self.backend.fallback_command.is_none() {
            warnings.push("backend.fallback_health_command is set without a fallback_command".to_string());
        }

        warnings
    }
}

/// Runtime configuration: resolved paths plus the layered settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: SteadfastToml,
    pub verbose: bool,
}

impl Config {
    /// Resolve the project directory and load `steadfast.toml` with
    /// environment overrides.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = SteadfastToml::load_or_default(&state_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        for warning in toml.validate() {
            tracing::warn!("{}", warning);
        }

        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose,
        })
    }

    /// Apply CLI flags, the last layer.
    pub fn with_cli_overrides(mut self, max_parallel: Option<usize>, max_attempts: Option<u32>) -> Self {
        if let Some(n) = max_parallel {
            self.toml.executor.max_parallel = n;
        }
        if let Some(n) = max_attempts {
            self.toml.recovery.max_attempts = n;
        }
        self
    }

    pub fn plan_file(&self) -> PathBuf {
        self.state_dir.join("plan.json")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn recovery_file(&self) -> PathBuf {
        self.state_dir.join("recovery.json")
    }

    pub fn escalations_dir(&self) -> PathBuf {
        self.state_dir.join("escalations")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("run.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("steadfast.toml")
    }

    /// Primary backend command, if configured.
    pub fn backend_command(&self) -> Option<&str> {
        self.toml.backend.command.as_deref()
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.backend.timeout_secs)
    }

    /// Fingerprint binding checkpoints to the backend settings. Changing
    /// the commands or the attempt budget invalidates old checkpoints.
    pub fn fingerprint(&self) -> String {
        if let Some(explicit) = &self.toml.checkpoint.fingerprint {
            return explicit.clone();
        }
        let backend = &self.toml.backend;
        let max_attempts = self.toml.recovery.max_attempts.to_string();
        compute_fingerprint(&[
            backend.command.as_deref().unwrap_or_default(),
            backend.fallback_command.as_deref().unwrap_or_default(),
            max_attempts.as_str(),
        ])
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_max_parallel(self.toml.executor.max_parallel)
            .with_max_pause(Duration::from_secs(self.toml.executor.max_pause_secs))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let section = &self.toml.rate_limit;
        RateLimitConfig {
            max_wait: Duration::from_secs(section.max_wait_secs),
            backoff_multiplier: section.backoff_multiplier,
            max_retries: section.max_retries,
        }
    }

    pub fn classifier(&self) -> RateLimitClassifier {
        let section = &self.toml.rate_limit;
        RateLimitClassifier::new(
            Duration::from_secs(section.default_wait_secs),
            Duration::from_secs(section.max_wait_secs),
        )
    }

    pub fn plan_store(&self) -> PlanStore {
        PlanStore::new(self.plan_file())
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.checkpoint_file(), &self.fingerprint())
    }

    /// Recovery manager backed by `recovery.json`, with history loaded.
    pub fn recovery_manager(&self) -> Result<RecoveryManager> {
        let mut manager = RecoveryManager::new(self.toml.recovery.max_attempts)
            .with_similarity_threshold(self.toml.recovery.similarity_threshold)
            .with_store(self.recovery_file())
            .with_escalation_dir(self.escalations_dir());
        manager.load().context("Failed to load recovery history")?;
        Ok(manager)
    }
}
