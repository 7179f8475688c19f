//! Access token handling.
//!
//! The Canvas personal access token is wrapped in [`AccessToken`], whose
//! `Debug` and `Display` both render the masked form. The raw value is only
//! reachable inside the crate, where the HTTP client turns it into a bearer
//! header.

use std::fmt;

use thiserror::Error;
use tracing::debug;

/// Environment variables consulted for the token, in order.
pub const TOKEN_ENV_VARS: [&str; 2] = ["ACCESS_TOKEN", "CANVAS_DL_TOKEN"];

/// Errors from resolving credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No token in the flag, environment or config file.
    #[error(
        "no Canvas access token found\n  Suggestion: pass --token, set ACCESS_TOKEN, or add `access_token = \"...\"` to the config file"
    )]
    Missing,
}

/// A Canvas API access token that never prints its full value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token value (surrounding whitespace is trimmed).
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self(raw.trim().to_string())
    }

    /// Resolves the token from the first non-empty source: CLI flag, the
    /// environment (`ACCESS_TOKEN`, then `CANVAS_DL_TOKEN`), the config file.
    ///
    /// `env` is injected so callers (and tests) control the lookup.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] when every source is absent or blank.
    pub fn resolve<F>(
        flag: Option<&str>,
        env: F,
        config: Option<&str>,
    ) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = non_blank(flag) {
            debug!(source = "flag", "using access token");
            return Ok(Self::new(token));
        }
        for name in TOKEN_ENV_VARS {
            if let Some(token) = non_blank(env(name).as_deref()) {
                debug!(source = name, "using access token");
                return Ok(Self::new(token));
            }
        }
        if let Some(token) = non_blank(config) {
            debug!(source = "config", "using access token");
            return Ok(Self::new(token));
        }
        Err(CredentialError::Missing)
    }

    /// Masked rendering, safe for logs.
    #[must_use]
    pub fn masked(&self) -> String {
        mask_token(&self.0)
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&self.masked()).finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Masks a token to its first and last four characters.
///
/// Tokens of eight characters or fewer are fully hidden.
///
/// ```
/// use canvas_dl::mask_token;
///
/// assert_eq!(mask_token("1234~abcdefghijklmnop"), "1234…mnop");
/// assert_eq!(mask_token("short"), "***TOKEN***");
/// ```
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***TOKEN***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
