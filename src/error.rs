//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else propagates as `anyhow::Error`. The worker recovers the
//! kind of a crawl failure by downcasting to [`CrawlError`].

use thiserror::Error;

/// Why a single page could not be fetched. Always folded into the page
/// result; never aborts a crawl.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("not an HTML page (content-type: {0})")]
    NotHtml(String),
    #[error("render failed: {0}")]
    Render(String),
}

/// Controller-level crawl failures.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The seed URL cannot be crawled at all. Retrying will not help.
    #[error("invalid seed URL '{url}': {reason}")]
    InvalidSeed { url: String, reason: String },
    /// An include/exclude path pattern does not compile.
    #[error("invalid path filter '{pattern}': {reason}")]
    InvalidFilter { pattern: String, reason: String },
    /// The event consumer went away mid-crawl.
    #[error("crawl aborted: progress receiver dropped")]
    Aborted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("source {0} already has an active crawl job")]
    SourceBusy(String),
    #[error("job queue is shut down")]
    Closed,
}

/// Outcome classification for a failed job attempt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Terminal on first occurrence.
    #[error("{0}")]
    Fatal(String),
    /// Eligible for retry with backoff.
    #[error("{0}")]
    Retryable(String),
}

impl JobError {
    pub fn classify(err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        if let Some(JobError::Fatal(_)) = err.downcast_ref::<JobError>() {
            return JobError::Fatal(message);
        }
        match err.downcast_ref::<CrawlError>() {
            Some(CrawlError::InvalidSeed { .. }) | Some(CrawlError::InvalidFilter { .. }) => {
                JobError::Fatal(message)
            }
            _ => JobError::Retryable(message),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Fatal(m) | JobError::Retryable(m) => m,
        }
    }
}
