//! Constants for the API module (timeouts, rate limiting, paging).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large lecture recordings).
///
/// This is an idle timeout: it fires when no bytes arrive for this long, so a
/// slow but steady multi-gigabyte download is never cut off. File downloads
/// get no other bound.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Total time allowed for one API call (listing page, course lookup), body included.
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Pause applied when the budget is exhausted but the server sent no reset time.
pub const EXHAUSTED_FALLBACK_PAUSE: Duration = Duration::from_secs(1);

/// Pause applied after a 429 without a usable Retry-After header.
pub const RATE_LIMITED_FALLBACK_PAUSE: Duration = Duration::from_secs(1);

/// Reset header values above this are Unix epoch seconds, below it delta seconds.
pub const EPOCH_RESET_THRESHOLD: u64 = 1_000_000_000;

/// Canvas listing page size.
pub const PER_PAGE: &str = "100";

/// Default Canvas API root.
pub const DEFAULT_API_URL: &str = "https://canvas.uva.nl/api/v1";
