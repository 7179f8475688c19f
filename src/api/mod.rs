//! Canvas REST API access.
//!
//! This module contains everything that touches the network before a file is
//! written: the authenticated client, pagination, the shared rate budget and
//! the retry policy that both listing and downloading follow.
//!
//! # Overview
//!
//! - [`ApiClient`] - bearer-authenticated GETs and streamed downloads
//! - [`PageFetcher`] - lazy pull iterator over `Link`-paginated listings
//! - [`RateBudget`] - shared permit counter fed by rate-limit headers
//! - [`RetryPolicy`] - bounded exponential backoff with jitter
//! - [`Entry`] - listing JSON classified into folders and files

mod client;
pub mod constants;
mod entry;
mod error;
mod pagination;
mod rate_budget;
mod retry;

pub use client::ApiClient;
pub use constants::DEFAULT_API_URL;
pub use entry::{Entry, FileEntry, FolderEntry, ModuleEntry, ModuleItem};
pub use error::FetchError;
pub use pagination::{Page, PageFetcher, parse_next_link};
pub use rate_budget::{RateBudget, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
