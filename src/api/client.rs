//! HTTP client wrapper for the Canvas REST API.
//!
//! [`ApiClient`] owns one pooled `reqwest::Client`, the access token and the
//! shared [`RateBudget`]. Every request goes through the same path: acquire a
//! budget permit, send, fold the rate-limit headers back into the budget, map
//! the status to a [`FetchError`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::FetchError;
use super::constants::{
    CONNECT_TIMEOUT_SECS, RATE_LIMITED_FALLBACK_PAUSE, READ_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS,
};
use super::pagination::PageFetcher;
use super::rate_budget::{RateBudget, parse_retry_after};
use crate::auth::AccessToken;
use crate::user_agent;

/// Authenticated Canvas API client.
///
/// Cheap to clone: the connection pool and the budget are shared.
///
/// # Example
///
/// ```no_run
/// use canvas_dl::{AccessToken, ApiClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ApiClient::new("https://canvas.uva.nl/api/v1", AccessToken::new("token"))?;
/// let url = client.endpoint("courses/42", &[])?;
/// let course: serde_json::Value = client.get_json(&url).await?;
/// println!("{}", course["name"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: AccessToken,
    budget: Arc<RateBudget>,
    /// Total bound on one API call. Downloads only have the idle read timeout.
    request_timeout: Duration,
}

impl ApiClient {
    /// Creates a client with default timeouts and a fresh budget.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] for a malformed base URL and
    /// [`FetchError::ClientBuild`] if the TLS backend cannot be initialised.
    pub fn new(base_url: &str, token: AccessToken) -> Result<Self, FetchError> {
        Self::with_options(
            base_url,
            token,
            Arc::new(RateBudget::new()),
            CONNECT_TIMEOUT_SECS,
            READ_TIMEOUT_SECS,
        )
    }

    /// Creates a client with explicit timeouts and an injected budget.
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::new`].
    pub fn with_options(
        base_url: &str,
        token: AccessToken,
        budget: Arc<RateBudget>,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, FetchError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base_url = Url::parse(trimmed).map_err(|_| FetchError::invalid_url(trimmed))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::invalid_url(trimmed));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(|source| FetchError::ClientBuild { source })?;

        Ok(Self {
            client,
            base_url,
            token,
            budget,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        })
    }

    /// Overrides the total time allowed for one API call, body included.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The shared rate budget.
    #[must_use]
    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// The API root this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds `<base>/<path>?<params>`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if the joined URL does not parse.
    pub fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, FetchError> {
        let raw = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&raw).map_err(|_| FetchError::invalid_url(raw.clone()))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    /// Starts a lazy page sequence at `url`.
    #[must_use]
    pub fn pages(&self, url: Url) -> PageFetcher {
        PageFetcher::new(self.clone(), url)
    }

    /// Issues one authenticated GET.
    ///
    /// # Errors
    ///
    /// [`FetchError::Auth`] on 401/403, [`FetchError::RateLimited`] on 429 (the
    /// budget is paused for the Retry-After duration first),
    /// [`FetchError::HttpStatus`] on other failures, network errors otherwise.
    pub async fn get(&self, url: &Url) -> Result<Response, FetchError> {
        self.send(url, true, Some(self.request_timeout)).await
    }

    /// GETs `url` and deserializes the JSON body.
    ///
    /// # Errors
    ///
    /// As [`ApiClient::get`], plus [`FetchError::Malformed`] when the body is
    /// not the expected JSON.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, FetchError> {
        let response = self.get(url).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::malformed(url.as_str(), e.to_string()))
    }

    /// Streams `url` into `staging`, returning the byte count.
    ///
    /// The bearer header is attached only when `url` points at the API host;
    /// pre-signed file URLs on other hosts are fetched without it. A partial
    /// staging file is removed before an error is returned.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`]; IO failures carry the staging path.
    #[instrument(level = "debug", skip(self, staging), fields(url = %url))]
    pub async fn download(&self, url: &str, staging: &Path) -> Result<u64, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        let authorize = self.is_api_host(&parsed);
        let response = self.send(&parsed, authorize, None).await?;

        let mut file = File::create(staging)
            .await
            .map_err(|e| FetchError::io(staging, e))?;
        let result = stream_to_file(&mut file, response, url, staging).await;
        if result.is_err() {
            debug!(path = %staging.display(), "cleaning up partial file after error");
            drop(file);
            let _ = tokio::fs::remove_file(staging).await;
        }
        result
    }

    fn is_api_host(&self, url: &Url) -> bool {
        url.scheme() == self.base_url.scheme()
            && url.host_str() == self.base_url.host_str()
            && url.port_or_known_default() == self.base_url.port_or_known_default()
    }

    async fn send(
        &self,
        url: &Url,
        authorize: bool,
        total_timeout: Option<Duration>,
    ) -> Result<Response, FetchError> {
        self.budget.acquire().await;

        let mut request = self.client.get(url.clone());
        if let Some(timeout) = total_timeout {
            request = request.timeout(timeout);
        }
        if authorize {
            request = request.bearer_auth(self.token.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))?;

        self.budget.observe(response.headers()).await;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        debug!(url = %url, status = status.as_u16(), "request failed");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::auth(url.as_str(), status.as_u16()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                self.budget
                    .pause_for(retry_after.unwrap_or(RATE_LIMITED_FALLBACK_PAUSE))
                    .await;
                Err(FetchError::rate_limited(url.as_str(), retry_after))
            }
            _ => Err(FetchError::http_status(url.as_str(), status.as_u16())),
        }
    }
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| FetchError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(file_path, e))?;
    writer
        .get_mut()
        .sync_all()
        .await
        .map_err(|e| FetchError::io(file_path, e))?;

    Ok(bytes_written)
}
