//! Shared request budget derived from the server's rate-limit headers.
//!
//! One [`RateBudget`] is shared (behind an `Arc`) by the page fetcher and every
//! download worker of a course download. All reads and writes go through a
//! single `tokio::sync::Mutex`, so granting a permit and folding in a
//! response's headers are atomic read-modify-write steps: two workers can
//! never both consume the last permit of a window.
//!
//! Three things can hold requests back:
//! - a known `remaining` count that has reached zero (wait for the window reset),
//! - a global pause set after a 429 (`Retry-After`),
//! - nothing at all when the server sends no rate-limit headers.
//!
//! # Usage Pattern
//!
//! ```no_run
//! use std::sync::Arc;
//! use canvas_dl::api::RateBudget;
//!
//! # async fn example() {
//! let budget = Arc::new(RateBudget::new());
//!
//! let shared = Arc::clone(&budget);
//! tokio::spawn(async move {
//!     shared.acquire().await;
//!     // ... request
//! });
//! # }
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{
    EPOCH_RESET_THRESHOLD, EXHAUSTED_FALLBACK_PAUSE, MAX_RETRY_AFTER,
};

const REMAINING_HEADERS: [&str; 3] = [
    "x-rate-limit-remaining",
    "x-ratelimit-remaining",
    "ratelimit-remaining",
];

const RESET_HEADERS: [&str; 2] = ["x-ratelimit-reset", "ratelimit-reset"];

/// Process-wide request budget for one course download.
#[derive(Debug, Default)]
pub struct RateBudget {
    /// Whether budgeting is disabled (every permit is granted immediately).
    disabled: bool,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Default)]
struct BudgetState {
    /// Requests still allowed in the current window, when the server told us.
    remaining: Option<u64>,
    /// When the current window resets.
    reset_at: Option<Instant>,
    /// Global pause deadline after a 429 or an exhausted window.
    paused_until: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
enum Grant {
    Granted,
    WaitUntil(Instant),
}

impl BudgetState {
    fn try_grant(&mut self, now: Instant) -> Grant {
        if let Some(until) = self.paused_until {
            if until > now {
                return Grant::WaitUntil(until);
            }
            self.paused_until = None;
        }

        if self.reset_at.is_some_and(|reset| reset <= now) {
            self.remaining = None;
            self.reset_at = None;
        }

        match self.remaining {
            None => Grant::Granted,
            Some(0) => {
                let until = match self.reset_at {
                    Some(reset) => reset,
                    None => {
                        // No window to wait for: pause briefly, then let one
                        // request through to learn the new count.
                        self.remaining = None;
                        now + EXHAUSTED_FALLBACK_PAUSE
                    }
                };
                self.paused_until = Some(until);
                Grant::WaitUntil(until)
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                Grant::Granted
            }
        }
    }

    fn observe(&mut self, remaining: Option<u64>, reset_in: Option<Duration>, now: Instant) {
        let Some(server) = remaining else {
            return;
        };
        let new_reset = reset_in.map(|delta| now + delta);

        match (new_reset, self.reset_at) {
            // A later reset than the one we track means the server opened a new window.
            (Some(new), Some(current)) if new > current + Duration::from_secs(1) => {
                self.remaining = Some(server);
                self.reset_at = Some(new);
            }
            // Same window: never give back permits we already handed out.
            (_, Some(_)) => {
                self.remaining = Some(self.remaining.map_or(server, |local| local.min(server)));
            }
            (Some(new), None) => {
                self.remaining = Some(server);
                self.reset_at = Some(new);
            }
            // Windowless counters (Canvas' leaky bucket) refill continuously,
            // so the latest server figure is authoritative.
            (None, None) => {
                self.remaining = Some(server);
            }
        }
    }

    fn pause_for(&mut self, delay: Duration, now: Instant) {
        let until = now + delay;
        if self.paused_until.is_none_or(|current| current < until) {
            self.paused_until = Some(until);
        }
    }
}

impl RateBudget {
    /// Creates an empty budget that grants freely until the server reports limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a budget that never waits. Used by tests.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Returns true if budgeting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Waits until a request may be issued, consuming one permit.
    ///
    /// Blocks while a global pause is active or while a known window is
    /// exhausted; every waiting worker wakes at the same deadline.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        loop {
            let grant = {
                let mut state = self.state.lock().await;
                state.try_grant(Instant::now())
            };
            match grant {
                Grant::Granted => return,
                Grant::WaitUntil(deadline) => {
                    debug!(
                        wait_ms = deadline
                            .saturating_duration_since(Instant::now())
                            .as_millis(),
                        "rate budget exhausted, pausing"
                    );
                    tokio::time::sleep_until(deadline).await;
                }
            }
        }
    }

    /// Folds a response's rate-limit headers into the budget.
    pub async fn observe(&self, headers: &HeaderMap) {
        if self.disabled {
            return;
        }
        let remaining = parse_remaining(headers);
        let reset_in = parse_reset(headers, SystemTime::now());
        if remaining.is_none() {
            return;
        }
        debug!(?remaining, ?reset_in, "observed rate-limit headers");
        let mut state = self.state.lock().await;
        state.observe(remaining, reset_in, Instant::now());
    }

    /// Pauses every requester for `delay` (extends, never shortens, an active pause).
    pub async fn pause_for(&self, delay: Duration) {
        if self.disabled {
            return;
        }
        warn!(delay_secs = delay.as_secs_f64(), "server rate limit, pausing all requests");
        let mut state = self.state.lock().await;
        state.pause_for(delay, Instant::now());
    }

    /// Remaining permits in the current window, if known.
    pub async fn remaining(&self) -> Option<u64> {
        self.state.lock().await.remaining
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Reads the remaining-requests header. Canvas reports a fractional cost bucket,
/// so the value is floored.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_remaining(headers: &HeaderMap) -> Option<u64> {
    REMAINING_HEADERS.iter().find_map(|name| {
        let value = header_str(headers, name)?.trim().parse::<f64>().ok()?;
        if value.is_finite() {
            Some(value.max(0.0).floor() as u64)
        } else {
            None
        }
    })
}

/// Reads the reset header as a delay from now. Values above 10^9 are treated
/// as Unix epoch seconds, smaller ones as delta seconds.
fn parse_reset(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    RESET_HEADERS.iter().find_map(|name| {
        let raw = header_str(headers, name)?.trim().parse::<u64>().ok()?;
        let delay = if raw > EPOCH_RESET_THRESHOLD {
            let reset = UNIX_EPOCH + Duration::from_secs(raw);
            reset.duration_since(now).unwrap_or(Duration::ZERO)
        } else {
            Duration::from_secs(raw)
        };
        Some(delay.min(MAX_RETRY_AFTER))
    })
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use canvas_dl::api::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(SystemTime::now())
                .map_or(Duration::ZERO, |delay| delay.min(MAX_RETRY_AFTER)),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
