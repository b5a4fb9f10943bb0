//! Detect throttling in backend errors and extract a retry-after hint.

use crate::backend::BackendError;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static RATE_LIMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:429|529)\b|rate[\s_-]?limit|quota[\s_-]+exceeded|overloaded|too many requests|throttl",
    )
    .unwrap()
});

static RETRY_AFTER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry[\s_-]?after|try again in)[\s:=]*(\d+(?:\.\d+)?)\s*(?:(milliseconds?|ms|minutes?|mins?|m|seconds?|secs?|s)\b)?",
    )
    .unwrap()
});

/// Result of classifying one backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitClassification {
    pub is_rate_limit: bool,
    /// How long to wait before retrying. Zero when not a rate limit.
    pub retry_after: Duration,
}

impl RateLimitClassification {
    pub fn not_rate_limited() -> Self {
        Self {
            is_rate_limit: false,
            retry_after: Duration::ZERO,
        }
    }
}

/// Classifies errors by status code and message patterns.
#[derive(Debug, Clone)]
pub struct RateLimitClassifier {
    default_wait: Duration,
    max_wait: Duration,
}

impl RateLimitClassifier {
    pub fn new(default_wait: Duration, max_wait: Duration) -> Self {
        Self {
            default_wait,
            max_wait,
        }
    }

    /// Classify a backend error.
    ///
    /// Status 429 and 529 are always throttling; otherwise the message is
    /// matched against known throttling phrases. The wait comes from the
    /// backend's own hint, then from the message, then from the configured
    /// default, and is capped at the configured maximum.
    pub fn classify(&self, error: &BackendError) -> RateLimitClassification {
        let by_status = matches!(error.status_code, Some(429) | Some(529));
        if !by_status && !RATE_LIMIT_REGEX.is_match(&error.message) {
            return RateLimitClassification::not_rate_limited();
        }

        let wait = error
            .retry_after
            .or_else(|| parse_retry_after(&error.message))
            .unwrap_or(self.default_wait);

        RateLimitClassification {
            is_rate_limit: true,
            retry_after: wait.min(self.max_wait),
        }
    }

    /// Classify a bare message with no status signal.
    pub fn classify_message(&self, message: &str) -> RateLimitClassification {
        self.classify(&BackendError::new(message))
    }
}

/// Extract a retry-after hint such as `retry-after: 30`, `retry after 500ms`
/// or `try again in 2 minutes`. A bare number is seconds.
fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RETRY_AFTER_REGEX.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase());

    let secs = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
        Some(u) if u.starts_with('m') => value * 60.0,
        _ => value,
    };

    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
