//! Lazy pull-based pagination over Canvas listing endpoints.
//!
//! Canvas splits listings into pages and announces the next one in an
//! RFC 5988 `Link` header:
//!
//! ```text
//! Link: <https://canvas.test/api/v1/courses/1/files?page=2&per_page=100>; rel="next",
//!       <https://canvas.test/api/v1/courses/1/files?page=1&per_page=100>; rel="first"
//! ```
//!
//! [`PageFetcher`] performs one GET per [`PageFetcher::next_page`] call. It is
//! not restartable: once the last page has been returned it keeps yielding
//! `Ok(None)`.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::LINK;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use super::client::ApiClient;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use super::FetchError;

/// One `<url>; params` element of a Link header.
#[allow(clippy::expect_used)]
static LINK_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]*)>\s*((?:;\s*[^;,]*)*)"#).expect("link element regex is valid")
});

/// The `rel` parameter of a Link element (quoted or bare).
#[allow(clippy::expect_used)]
static REL_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i);\s*rel\s*=\s*"?([^";,]+)"?"#).expect("rel regex is valid")
});

/// One page of listing entries.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Raw JSON entries in server order.
    pub entries: Vec<Value>,
    /// The `rel="next"` link, absent on the last page.
    pub next: Option<Url>,
}

impl Page {
    /// Returns true when no further page follows.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Pull iterator over a paginated endpoint.
///
/// ```no_run
/// use canvas_dl::{AccessToken, ApiClient};
///
/// # async fn example() -> Result<(), canvas_dl::FetchError> {
/// let client = ApiClient::new("https://canvas.uva.nl/api/v1", AccessToken::new("token"))?;
/// let mut pages = client.pages(client.endpoint("courses/1/files", &[("per_page", "100")])?);
/// while let Some(page) = pages.next_page().await? {
///     println!("{} entries", page.entries.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PageFetcher {
    client: ApiClient,
    next: Option<Url>,
    pages_fetched: u32,
}

impl PageFetcher {
    pub(crate) fn new(client: ApiClient, start: Url) -> Self {
        Self {
            client,
            next: Some(start),
            pages_fetched: 0,
        }
    }

    /// Returns true once the final page has been handed out.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    /// Pages successfully fetched so far.
    #[must_use]
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Fetches the next page.
    ///
    /// Returns `Ok(None)` when the sequence is exhausted. On error the cursor is
    /// left where it was, so calling again retries the same page.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`] from the request, or [`FetchError::Malformed`] when
    /// the body is not a JSON array or object.
    #[instrument(level = "debug", skip(self), fields(page = self.pages_fetched + 1))]
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        let Some(url) = self.next.clone() else {
            return Ok(None);
        };

        let response = self.client.get(&url).await?;
        let next = response
            .headers()
            .get(LINK)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_next_link(value, &url));
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))?;
        let entries = parse_entries(&body, &url)?;

        if next.as_ref() == Some(&url) {
            warn!(url = %url, "next link points at the current page, stopping");
            self.next = None;
        } else {
            self.next = next;
        }
        self.pages_fetched += 1;
        debug!(
            entries = entries.len(),
            has_next = self.next.is_some(),
            "fetched page"
        );

        Ok(Some(Page {
            entries,
            next: self.next.clone(),
        }))
    }

    /// Fetches the next page, retrying transient and rate-limited failures
    /// under `policy`.
    ///
    /// # Errors
    ///
    /// The last error once the policy gives up, or immediately for auth and
    /// fatal failures.
    pub async fn next_page_with_retry(
        &mut self,
        policy: &RetryPolicy,
    ) -> Result<Option<Page>, FetchError> {
        let mut attempt = 1;
        loop {
            match self.next_page().await {
                Ok(page) => return Ok(page),
                Err(error) => match policy.should_retry(classify_error(&error), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        let delay = match &error {
                            FetchError::RateLimited {
                                retry_after: Some(wait),
                                ..
                            } => *wait,
                            _ => delay,
                        };
                        warn!(
                            error = %error,
                            attempt = next,
                            delay_ms = delay.as_millis(),
                            "page fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(reason, "giving up on page");
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Drains every remaining page into one entry list.
    ///
    /// # Errors
    ///
    /// The first page error that survives `policy`.
    pub async fn collect_all(&mut self, policy: &RetryPolicy) -> Result<Vec<Value>, FetchError> {
        let mut entries = Vec::new();
        while let Some(page) = self.next_page_with_retry(policy).await? {
            entries.extend(page.entries);
        }
        Ok(entries)
    }
}

/// Extracts the `rel="next"` target from a Link header, resolved against `base`.
#[must_use]
pub fn parse_next_link(header: &str, base: &Url) -> Option<Url> {
    LINK_ELEMENT.captures_iter(header).find_map(|caps| {
        let target = caps.get(1)?.as_str().trim();
        let params = caps.get(2).map_or("", |m| m.as_str());
        let is_next = REL_PARAM.captures_iter(params).any(|rel| {
            rel.get(1).is_some_and(|value| {
                value
                    .as_str()
                    .split_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("next"))
            })
        });
        if is_next { base.join(target).ok() } else { None }
    })
}

fn parse_entries(body: &[u8], url: &Url) -> Result<Vec<Value>, FetchError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::malformed(url.as_str(), e.to_string()))?;
    match value {
        Value::Array(entries) => Ok(entries),
        Value::Object(_) => Ok(vec![value]),
        other => Err(FetchError::malformed(
            url.as_str(),
            format!("expected a JSON array or object, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
