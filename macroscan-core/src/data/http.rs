//! HTTP GET primitive.
//!
//! Retrievers depend on [`HttpFetch`] rather than on reqwest directly, so
//! extraction logic can be exercised against saved documents.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use std::time::Duration;
use thiserror::Error;

use super::provider::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/119.0 Safari/537.36";

/// Transport-level failure, before indicator context is attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("HTTP {status}")]
    Status {
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl HttpError {
    /// Classify into the retrieval error taxonomy.
    ///
    /// 429 and 503 mean the source is pushing back; 404 means the page does
    /// not exist for this country. Anything else is a generic network error.
    pub fn into_fetch_error(self, indicator: &str, url: &str) -> FetchError {
        match self {
            HttpError::Status {
                status: status @ (429 | 503),
                retry_after_secs,
            } => FetchError::RateLimited {
                url: url.to_string(),
                status,
                retry_after_secs,
            },
            HttpError::Status { status: 404, .. } => FetchError::NotFound {
                indicator: indicator.to_string(),
                url: url.to_string(),
            },
            HttpError::Status { status, .. } => FetchError::Network {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
                timeout: false,
            },
            HttpError::Timeout => FetchError::Network {
                url: url.to_string(),
                reason: "request timed out".into(),
                timeout: true,
            },
            HttpError::Transport(reason) => FetchError::Network {
                url: url.to_string(),
                reason,
                timeout: false,
            },
        }
    }
}

/// `fetch(url) -> raw document`.
pub trait HttpFetch: Send + Sync {
    fn get(&self, url: &str) -> Result<String, HttpError>;
}

/// Blocking reqwest client with browser-like headers and a request timeout.
pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| HttpError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

fn transport_error(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Transport(e.to_string())
    }
}

impl HttpFetch for ReqwestFetcher {
    fn get(&self, url: &str) -> Result<String, HttpError> {
        let resp = self.client.get(url).send().map_err(transport_error)?;
        let status = resp.status();

        if !status.is_success() {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(HttpError::Status {
                status: status.as_u16(),
                retry_after_secs,
            });
        }

        resp.text().map_err(transport_error)
    }
}
