//! Observation records produced by the pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which retrieval strategy produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Api,
    Scrape,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Api => "api",
            Source::Scrape => "scrape",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Source::Api),
            "scrape" => Ok(Source::Scrape),
            other => Err(format!("unknown source '{other}' (expected 'api' or 'scrape')")),
        }
    }
}

/// Raw text fragments for one indicator, exactly as the source returned them.
///
/// Transient: produced by a retriever, consumed by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub indicator_key: String,
    pub current_raw: Option<String>,
    pub previous_raw: Option<String>,
    pub expected_raw: Option<String>,
    /// Month the current value refers to.
    pub reference_period: Option<NaiveDate>,
    pub next_release: Option<NaiveDate>,
    pub fetched_at: DateTime<Utc>,
    pub source: Source,
}

/// Normalized numeric values for one indicator at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub indicator_key: String,
    pub current: Option<f64>,
    pub previous: Option<f64>,
    pub expected: Option<f64>,
    /// `current - previous` when both are present.
    pub difference: Option<f64>,
    /// `current - expected` when both are present.
    #[serde(default)]
    pub surprise: Option<f64>,
    /// First day of the month the current value refers to.
    #[serde(default)]
    pub reference_period: Option<NaiveDate>,
    /// Date of the next scheduled release.
    #[serde(default)]
    pub next_release: Option<NaiveDate>,
    pub timestamp_utc: DateTime<Utc>,
    pub source: Source,
}

impl Observation {
    /// True when at least the headline (current) value was obtained.
    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }
}

/// Difference of two optional values; absent unless both are present.
pub fn delta(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}
