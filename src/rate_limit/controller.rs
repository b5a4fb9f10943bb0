//! Process-wide throttle state machine.
//!
//! ```text
//! ok -> throttled -> paused         -> ok   (probe succeeds / resume())
//!                 -> using_fallback -> ok   (primary probe succeeds / resume())
//!                    using_fallback -> paused (fallback throttled too)
//! ```
//!
//! One controller is shared by every in-flight dispatch, so a signal from
//! any of them immediately affects all the others. State lives behind a
//! `watch` channel: dispatches wait on it and observers subscribe to it.

use super::classifier::RateLimitClassification;
use crate::backend::{BackendKind, HealthProbe};
use crate::errors::RateLimitExhausted;
use crate::util::duration_serde;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStatus {
    #[default]
    Ok,
    Throttled,
    Paused,
    UsingFallback,
}

impl std::fmt::Display for RateLimitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitStatus::Ok => write!(f, "ok"),
            RateLimitStatus::Throttled => write!(f, "throttled"),
            RateLimitStatus::Paused => write!(f, "paused"),
            RateLimitStatus::UsingFallback => write!(f, "using_fallback"),
        }
    }
}

/// Snapshot of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateLimitState {
    pub status: RateLimitStatus,
    /// Retry-after hint of the most recent signal
    #[serde(with = "duration_serde")]
    pub retry_after: Duration,
    /// Current wait before the next recovery probe
    #[serde(with = "duration_serde")]
    pub wait: Duration,
    /// Rate-limit signals since the last resume
    pub retry_count: u32,
    pub using_fallback: bool,
    /// Recovery probes since the last signal
    pub resume_attempts: u32,
    /// Probing gave up; only `resume()` lifts the pause
    pub manual_resume_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A status change, broadcast to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTransition {
    pub from: RateLimitStatus,
    pub to: RateLimitStatus,
}

/// Where a dispatch should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

impl From<Route> for BackendKind {
    fn from(route: Route) -> Self {
        match route {
            Route::Primary => BackendKind::Primary,
            Route::Fallback => BackendKind::Fallback,
        }
    }
}

/// Backoff settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Cap on any single wait
    pub max_wait: Duration,
    /// Factor applied to the wait after each failed probe
    pub backoff_multiplier: f64,
    /// Failed probes before manual resume is required
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            max_retries: 5,
        }
    }
}

/// Shared throttle controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimitController {
    config: RateLimitConfig,
    state: Arc<watch::Sender<RateLimitState>>,
    transitions: broadcast::Sender<RateLimitTransition>,
    primary_probe: Option<Arc<dyn HealthProbe>>,
    fallback_probe: Option<Arc<dyn HealthProbe>>,
    recovery_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RateLimitController {
    pub fn new(config: RateLimitConfig) -> Self {
        let (state, _) = watch::channel(RateLimitState::default());
        let (transitions, _) = broadcast::channel(64);
        Self {
            config,
            state: Arc::new(state),
            transitions,
            primary_probe: None,
            fallback_probe: None,
            recovery_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Probe used to decide when the primary backend is usable again.
    /// Without one, the pause lifts as soon as the wait elapses.
    pub fn with_primary_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.primary_probe = Some(probe);
        self
    }

    /// Enable fallback routing. The probe reports whether the fallback
    /// backend is reachable at the moment of a rate-limit signal.
    pub fn with_fallback_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.fallback_probe = Some(probe);
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback_probe.is_some()
    }

    pub fn state(&self) -> RateLimitState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RateLimitStatus {
        self.state.borrow().status
    }

    /// Watch the full state.
    pub fn subscribe(&self) -> watch::Receiver<RateLimitState> {
        self.state.subscribe()
    }

    /// Receive every status transition.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<RateLimitTransition> {
        self.transitions.subscribe()
    }

    /// Whether the primary backend answers its health probe.
    pub async fn is_primary_backend_available(&self) -> bool {
        match &self.primary_probe {
            Some(probe) => probe.is_available().await,
            None => true,
        }
    }

    /// React to a throttling signal from a dispatch routed to `from`.
    pub async fn on_rate_limited(
        &self,
        classification: &RateLimitClassification,
        from: BackendKind,
        error: &str,
    ) {
        let wait = classification.retry_after.min(self.config.max_wait);
        let previous = self.status();

        self.state.send_modify(|s| {
            s.retry_count += 1;
            s.retry_after = classification.retry_after;
            s.last_error = Some(error.to_string());
        });

        // Already waiting; the running recovery task keeps its own backoff.
        let already_handled = match previous {
            RateLimitStatus::Paused => true,
            RateLimitStatus::UsingFallback => from == BackendKind::Primary,
            RateLimitStatus::Ok | RateLimitStatus::Throttled => false,
        };
        if already_handled {
            tracing::debug!(
                status = %previous,
                backend = %from,
                retry_count = self.state.borrow().retry_count,
                "Additional rate-limit signal while already degraded"
            );
            return;
        }

        self.transition(RateLimitStatus::Throttled, |s| {
            s.wait = wait;
            s.resume_attempts = 0;
            s.manual_resume_required = false;
        });
        tracing::warn!(
            backend = %from,
            wait_secs = wait.as_secs_f64(),
            retry_count = self.state.borrow().retry_count,
            "Rate limited"
        );

        let fallback_ready = match (&self.fallback_probe, from) {
            (Some(probe), BackendKind::Primary) => probe.is_available().await,
            _ => false,
        };

        if fallback_ready {
            self.transition(RateLimitStatus::UsingFallback, |s| s.using_fallback = true);
            tracing::warn!("Routing dispatches to the fallback backend");
        } else {
            self.transition(RateLimitStatus::Paused, |s| s.using_fallback = false);
            tracing::warn!(wait_secs = wait.as_secs_f64(), "Dispatch paused");
        }

        self.spawn_recovery(wait);
    }

    /// Return to `ok`, clear fallback routing and counters, and release any
    /// dispatch waiting on the pause.
    pub fn resume(&self) {
        if let Ok(mut task) = self.recovery_task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
        self.set_ok();
    }

    /// Wait until dispatching is allowed and return the route to use.
    ///
    /// Fails immediately when manual resume is required, or once the pause
    /// outlasts `max_pause`.
    pub async fn wait_until_dispatchable(&self, max_pause: Duration) -> Result<Route, RateLimitExhausted> {
        let start = Instant::now();
        let deadline = start + max_pause;
        let mut rx = self.state.subscribe();

        loop {
            {
                let state = rx.borrow_and_update();
                match state.status {
                    RateLimitStatus::Ok => return Ok(Route::Primary),
                    RateLimitStatus::UsingFallback => return Ok(Route::Fallback),
                    RateLimitStatus::Paused if state.manual_resume_required => {
                        return Err(RateLimitExhausted::ManualResumeRequired);
                    }
                    RateLimitStatus::Paused | RateLimitStatus::Throttled => {}
                }
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    return Err(RateLimitExhausted::MaxPauseExceeded {
                        waited: start.elapsed(),
                    });
                }
            }
        }
    }

    fn transition(&self, to: RateLimitStatus, update: impl FnOnce(&mut RateLimitState)) {
        let mut from = RateLimitStatus::Ok;
        self.state.send_modify(|s| {
            from = s.status;
            s.status = to;
            update(s);
        });
        if from != to {
            tracing::info!(from = %from, to = %to, "Rate-limit status changed");
            // No receivers is fine
            let _ = self.transitions.send(RateLimitTransition { from, to });
        }
    }

    fn set_ok(&self) {
        self.transition(RateLimitStatus::Ok, |s| {
            s.using_fallback = false;
            s.retry_count = 0;
            s.resume_attempts = 0;
            s.manual_resume_required = false;
            s.wait = Duration::ZERO;
            s.retry_after = Duration::ZERO;
        });
    }

    fn spawn_recovery(&self, initial_wait: Duration) {
        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.recovery_loop(initial_wait).await });

        match self.recovery_task.lock() {
            Ok(mut task) => {
                if let Some(previous) = task.replace(handle) {
                    previous.abort();
                }
            }
            Err(_) => tracing::error!("Recovery task slot poisoned; previous probe left running"),
        }
    }

    /// Sleep, probe the primary, back off on failure. Runs while paused or
    /// while routed to the fallback.
    async fn recovery_loop(self, initial_wait: Duration) {
        let mut wait = initial_wait;
        loop {
            tokio::time::sleep(wait).await;

            let status = self.status();
            if !matches!(status, RateLimitStatus::Paused | RateLimitStatus::UsingFallback) {
                return;
            }

            let mut attempt = 0;
            self.state.send_modify(|s| {
                s.resume_attempts += 1;
                attempt = s.resume_attempts;
            });

            if self.is_primary_backend_available().await {
                tracing::info!(attempt, "Primary backend available again, resuming");
                self.set_ok();
                return;
            }

            if attempt >= self.config.max_retries {
                if status == RateLimitStatus::Paused {
                    self.state.send_modify(|s| s.manual_resume_required = true);
                    tracing::error!(
                        attempts = attempt,
                        "Primary backend still unavailable; manual resume required"
                    );
                } else {
                    tracing::warn!(
                        attempts = attempt,
                        "Primary backend still unavailable; staying on the fallback"
                    );
                }
                return;
            }

            wait = next_backoff(wait, self.config.backoff_multiplier, self.config.max_wait);
            self.state.send_modify(|s| s.wait = wait);
            tracing::debug!(attempt, wait_secs = wait.as_secs_f64(), "Primary still unavailable, backing off");
        }
    }
}

/// Grow `wait` by `multiplier`, capped at `max_wait`. Multipliers below 1.0
/// (or NaN) hold the wait steady; a product too large for a `Duration`
/// saturates at the cap.
fn next_backoff(wait: Duration, multiplier: f64, max_wait: Duration) -> Duration {
    Duration::try_from_secs_f64(wait.as_secs_f64() * multiplier.max(1.0))
        .unwrap_or(max_wait)
        .min(max_wait)
}

impl std::fmt::Debug for RateLimitController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitController")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .field("has_primary_probe", &self.primary_probe.is_some())
            .field("has_fallback", &self.fallback_probe.is_some())
            .finish()
    }
}
