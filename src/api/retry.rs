//! Retry logic with exponential backoff for transient failures.
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - 5xx, timeouts, dropped connections
//! - [`FailureType::RateLimited`] - HTTP 429, retried after the server's pause
//! - [`FailureType::Auth`] - credentials rejected, never retried
//! - [`FailureType::Fatal`] - malformed data, other 4xx, local IO, never retried
//!
//! The [`RetryPolicy`] then decides whether another attempt is made and how
//! long to wait before it. The same policy drives listing pages and file
//! downloads.
//!
//! # Example
//!
//! ```
//! use canvas_dl::api::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://canvas.test/files/1", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Default maximum attempts (including the first one).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default maximum delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default upper bound of the random jitter added to each delay.
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Server rate limiting (HTTP 429).
    RateLimited,
    /// Credentials rejected or access forbidden.
    Auth,
    /// Won't succeed no matter how often it is repeated.
    Fatal,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt the retry will be (1-indexed, first retry is attempt 2).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded retry with exponential backoff.
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a fully custom policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            max_jitter,
        }
    }

    /// Creates a policy with a custom attempt ceiling and default timing.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed with `failure_type`.
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Auth => {
                return RetryDecision::DoNotRetry {
                    reason: "credentials rejected - retry would not help".to_string(),
                };
            }
            FailureType::Fatal => {
                return RetryDecision::DoNotRetry {
                    reason: "fatal failure - retry would not help".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff for the retry following `attempt`, jitter included.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(1u32 << exponent);
        scaled.min(self.max_delay) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies a [`FetchError`] for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | 401, 403 | Auth |
/// | 429 | RateLimited |
/// | 408, 5xx | Transient |
/// | other 4xx | Fatal |
/// | timeout, network | Transient |
/// | malformed body, IO, invalid URL, cancelled | Fatal |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::Auth { .. } => FailureType::Auth,
        FetchError::RateLimited { .. } => FailureType::RateLimited,
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } | FetchError::Network { .. } => FailureType::Transient,
        FetchError::Malformed { .. }
        | FetchError::Io { .. }
        | FetchError::InvalidUrl { .. }
        | FetchError::ClientBuild { .. }
        | FetchError::Cancelled => FailureType::Fatal,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::Auth,
        429 => FailureType::RateLimited,
        408 | 500..=599 => FailureType::Transient,
        _ => FailureType::Fatal,
    }
}
