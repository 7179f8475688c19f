//! Error types for API requests and file transfers.
//!
//! Every variant carries the URL (or local path) it happened on. The access
//! token is sent only as a request header and is never part of any variant.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the Canvas API or downloading a file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server rejected the credentials (HTTP 401/403).
    #[error("[AUTH] HTTP {status} requesting {url}\n  Suggestion: {suggestion}")]
    Auth {
        /// The URL that was rejected.
        url: String,
        /// The HTTP status code (401 or 403).
        status: u16,
        /// User-facing hint for resolving the problem.
        suggestion: &'static str,
    },

    /// The server asked us to slow down (HTTP 429).
    #[error("rate limited (HTTP 429) requesting {url}")]
    RateLimited {
        /// The URL that was throttled.
        url: String,
        /// Parsed Retry-After hint, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// Any other non-success HTTP status.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response body could not be interpreted.
    #[error("malformed response from {url}: {reason}")]
    Malformed {
        /// The URL whose response was malformed.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// File system error while writing a download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed or could not be built.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The operation was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Creates a network error, promoting reqwest timeouts to [`FetchError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an authentication error.
    pub fn auth(url: impl Into<String>, status: u16) -> Self {
        let suggestion = if status == 403 {
            "The token lacks access to this resource; check course enrollment or file locks."
        } else {
            "Check the access token (ACCESS_TOKEN, --token, or `access_token` in the config file)."
        };
        Self::Auth {
            url: url.into(),
            status,
            suggestion,
        }
    }

    /// Creates a rate-limit error.
    pub fn rate_limited(url: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            url: url.into(),
            retry_after,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true for [`FetchError::Auth`].
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}
