//! Retrieval, retry, pacing and caching

pub mod api;
pub mod cache;
pub mod http;
pub mod pacing;
pub mod provider;
pub mod retry;
pub mod scrape;

pub use api::ApiRetriever;
pub use cache::{path_segment, CacheEntry, CacheError, CacheKey, Lookup, MissReason, ObservationCache};
pub use http::{HttpError, HttpFetch, ReqwestFetcher};
pub use pacing::{RateGate, RecordingSleeper, Sleeper, ThreadSleeper};
pub use provider::{DiagnosticSink, DiscardDiagnostics, FetchError, FetchErrorKind, Retriever};
pub use retry::{call_with_retry, RetryFailure, RetryPolicy};
pub use scrape::ScrapeRetriever;
