//! API snapshot retrieval strategy.
//!
//! One request per country returns every indicator the source tracks for
//! it; the response is memoized and each descriptor's `Category` rule picks
//! its entry.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::http::HttpFetch;
use super::provider::{FetchError, Retriever};
use crate::clock::Clock;
use crate::indicator::IndicatorDescriptor;
use crate::observation::{RawObservation, Source};

pub const DEFAULT_API_URL: &str = "https://api.tradingeconomics.com";

/// One element of the `/country/{country}` array.
#[derive(Debug, Clone, Deserialize)]
struct CountryEntry {
    #[serde(rename = "Category", alias = "category", default)]
    category: Option<String>,
    #[serde(rename = "LatestValue", alias = "latestValue", default)]
    latest_value: Option<Value>,
    #[serde(rename = "PreviousValue", alias = "previousValue", default)]
    previous_value: Option<Value>,
    #[serde(rename = "TEForecast", alias = "teforecast", alias = "teForecast", default)]
    te_forecast: Option<Value>,
    #[serde(rename = "Forecast", alias = "forecast", default)]
    forecast: Option<Value>,
}

/// Numbers and strings both come through as raw text for the normalizer.
fn raw_text(value: &Option<Value>) -> Option<String> {
    match value.as_ref()? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub struct ApiRetriever {
    http: Arc<dyn HttpFetch>,
    clock: Arc<dyn Clock>,
    base_url: String,
    api_key: String,
    snapshots: Mutex<HashMap<String, Arc<Vec<CountryEntry>>>>,
}

impl ApiRetriever {
    pub fn new(http: Arc<dyn HttpFetch>, clock: Arc<dyn Clock>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(http, clock, api_key, DEFAULT_API_URL)
    }

    pub fn with_base_url(
        http: Arc<dyn HttpFetch>,
        clock: Arc<dyn Clock>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            clock,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self, country: &str, indicator: &str) -> Result<Arc<Vec<CountryEntry>>, FetchError> {
        if let Some(entries) = self.snapshots.lock().unwrap().get(country) {
            return Ok(Arc::clone(entries));
        }

        // Error messages carry the URL without the credential.
        let public_url = format!("{}/country/{country}", self.base_url);
        let request = reqwest::Url::parse_with_params(&public_url, [("c", self.api_key.as_str())])
            .map_err(|e| FetchError::Parse {
                indicator: indicator.to_string(),
                url: public_url.clone(),
                reason: format!("invalid request URL: {e}"),
                snapshot: None,
            })?;
        let body = self
            .http
            .get(request.as_str())
            .map_err(|e| e.into_fetch_error(indicator, &public_url))?;

        let entries: Vec<CountryEntry> =
            serde_json::from_str(&body).map_err(|e| FetchError::Parse {
                indicator: indicator.to_string(),
                url: public_url.clone(),
                reason: format!("undecodable country snapshot: {e}"),
                snapshot: Some(body.clone()),
            })?;
        tracing::debug!(country, entries = entries.len(), "API country snapshot");

        let entries = Arc::new(entries);
        self.snapshots
            .lock()
            .unwrap()
            .insert(country.to_string(), Arc::clone(&entries));
        Ok(entries)
    }
}

impl Retriever for ApiRetriever {
    fn name(&self) -> &str {
        "tradingeconomics_api"
    }

    fn source(&self) -> Source {
        Source::Api
    }

    fn fetch(
        &self,
        descriptor: &IndicatorDescriptor,
        country: &str,
    ) -> Result<RawObservation, FetchError> {
        let key = descriptor.key.as_str();
        let not_found = || FetchError::NotFound {
            indicator: key.to_string(),
            url: format!("{}/country/{country}", self.base_url),
        };
        let category = descriptor.category().ok_or_else(not_found)?;

        let entries = self.snapshot(country, key)?;
        let entry = entries
            .iter()
            .find(|e| {
                e.category
                    .as_deref()
                    .is_some_and(|c| c.trim().eq_ignore_ascii_case(category))
            })
            .ok_or_else(not_found)?;

        Ok(RawObservation {
            indicator_key: key.to_string(),
            current_raw: raw_text(&entry.latest_value),
            previous_raw: raw_text(&entry.previous_value),
            expected_raw: raw_text(&entry.te_forecast).or_else(|| raw_text(&entry.forecast)),
            reference_period: None,
            next_release: None,
            fetched_at: self.clock.now(),
            source: Source::Api,
        })
    }
}
