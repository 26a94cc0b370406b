//! Retriever trait and structured fetch error types.
//!
//! The Retriever trait abstracts over retrieval strategies (API snapshot,
//! page scrape) so the pipeline can swap implementations by configuration
//! and tests can substitute canned responses.

use thiserror::Error;

use crate::indicator::IndicatorDescriptor;
use crate::observation::{RawObservation, Source};

/// Failure of a single retrieval attempt.
///
/// Only `Network` and `RateLimited` are transient; the retry controller
/// gives up immediately on the other two.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("network error for {url}: {reason}")]
    Network {
        url: String,
        reason: String,
        timeout: bool,
    },

    #[error("rate limited by source (HTTP {status}) for {url}")]
    RateLimited {
        url: String,
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("could not extract '{indicator}' from {url}: {reason}")]
    Parse {
        indicator: String,
        url: String,
        reason: String,
        /// Document as received, for diagnostic capture.
        snapshot: Option<String>,
    },

    #[error("'{indicator}' is not available at {url}")]
    NotFound { indicator: String, url: String },
}

/// Coarse error class, used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    RateLimited,
    Parse,
    NotFound,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network => "NetworkError",
            FetchErrorKind::RateLimited => "RateLimited",
            FetchErrorKind::Parse => "ParseError",
            FetchErrorKind::NotFound => "NotFound",
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network { .. } => FetchErrorKind::Network,
            FetchError::RateLimited { .. } => FetchErrorKind::RateLimited,
            FetchError::Parse { .. } => FetchErrorKind::Parse,
            FetchError::NotFound { .. } => FetchErrorKind::NotFound,
        }
    }

    /// Worth waiting out and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::RateLimited { .. }
        )
    }

    /// Source-provided hint for how long to back off.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            FetchError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// One retrieval strategy against the data source.
///
/// Implementations perform a single attempt and return raw text fragments;
/// retries, caching and numeric interpretation live above this trait.
pub trait Retriever: Send + Sync {
    /// Human-readable name of this retriever.
    fn name(&self) -> &str;

    /// Source tag stamped on produced observations.
    fn source(&self) -> Source;

    /// Fetch current/previous/expected text for one indicator of `country`.
    fn fetch(
        &self,
        descriptor: &IndicatorDescriptor,
        country: &str,
    ) -> Result<RawObservation, FetchError>;
}

/// Receiver of raw documents that failed extraction.
pub trait DiagnosticSink: Send + Sync {
    fn capture(&self, country: &str, indicator: &str, url: &str, reason: &str, snapshot: &str);
}

/// Sink that drops every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardDiagnostics;

impl DiagnosticSink for DiscardDiagnostics {
    fn capture(&self, _: &str, _: &str, _: &str, _: &str, _: &str) {}
}
