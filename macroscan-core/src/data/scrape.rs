//! Page-scrape retrieval strategy.
//!
//! Current and previous values come from the country's indicator overview
//! table (`/{country}/indicators`, fetched once per run and memoized). The
//! forecast comes from the indicator's own page, either from the
//! "is expected to be X" sentence or from the first unreleased row of the
//! release calendar table. That row's date is the next release; the
//! overview row's last cell (`Sep/25`) is the reference period.

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::http::HttpFetch;
use super::provider::{FetchError, Retriever};
use crate::clock::Clock;
use crate::indicator::IndicatorDescriptor;
use crate::observation::{RawObservation, Source};

pub const DEFAULT_SITE_URL: &str = "https://tradingeconomics.com";

// Calendar columns: Date, GMT, Reference, Actual, Previous, Consensus, TEForecast
const CAL_DATE: usize = 0;
const CAL_ACTUAL: usize = 3;
const CAL_CONSENSUS: usize = 5;
const CAL_FORECAST: usize = 6;

/// Scrapes the public site.
pub struct ScrapeRetriever {
    http: Arc<dyn HttpFetch>,
    clock: Arc<dyn Clock>,
    base_url: String,
    pages: Mutex<HashMap<String, Arc<str>>>,
}

impl ScrapeRetriever {
    pub fn new(http: Arc<dyn HttpFetch>, clock: Arc<dyn Clock>) -> Self {
        Self::with_base_url(http, clock, DEFAULT_SITE_URL)
    }

    pub fn with_base_url(
        http: Arc<dyn HttpFetch>,
        clock: Arc<dyn Clock>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            clock,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Overview page for a country, fetched at most once per retriever.
    fn overview(&self, url: &str, indicator: &str) -> Result<Arc<str>, FetchError> {
        if let Some(page) = self.pages.lock().unwrap().get(url) {
            return Ok(Arc::clone(page));
        }
        let body: Arc<str> = self
            .http
            .get(url)
            .map_err(|e| e.into_fetch_error(indicator, url))?
            .into();
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::clone(&body));
        Ok(body)
    }

    /// Forecast from the indicator page. Transient failures propagate so the
    /// caller can retry; anything else leaves the forecast absent.
    fn forecast(&self, url: &str, indicator: &str) -> Result<Forecast, FetchError> {
        match self.http.get(url) {
            Ok(body) => Ok(extract_forecast(&body)),
            Err(e) => {
                let err = e.into_fetch_error(indicator, url);
                if err.is_transient() {
                    return Err(err);
                }
                tracing::debug!(indicator, url, error = %err, "no forecast page");
                Ok(Forecast::default())
            }
        }
    }
}

impl Retriever for ScrapeRetriever {
    fn name(&self) -> &str {
        "tradingeconomics_scrape"
    }

    fn source(&self) -> Source {
        Source::Scrape
    }

    fn fetch(
        &self,
        descriptor: &IndicatorDescriptor,
        country: &str,
    ) -> Result<RawObservation, FetchError> {
        let key = descriptor.key.as_str();
        let overview_url = format!("{}/{country}/indicators", self.base_url);
        let Some((slug, row_label)) = descriptor.table_row() else {
            return Err(FetchError::NotFound {
                indicator: key.to_string(),
                url: overview_url,
            });
        };

        let page = self.overview(&overview_url, key)?;
        let parse_error = |reason: String| FetchError::Parse {
            indicator: key.to_string(),
            url: overview_url.clone(),
            reason,
            snapshot: Some(page.to_string()),
        };

        let cells = find_row(&page, country, slug, row_label)
            .ok_or_else(|| parse_error(format!("no table row for '{row_label}'")))?;
        if cells.len() < 3 {
            return Err(parse_error(format!(
                "row for '{row_label}' has {} cells, expected at least 3",
                cells.len()
            )));
        }
        tracing::debug!(indicator = key, ?cells, "overview row");

        let reference_period = if cells.len() >= 5 {
            cells.last().and_then(|c| parse_reference_period(c))
        } else {
            None
        };
        let forecast = self.forecast(&format!("{}/{country}/{slug}", self.base_url), key)?;

        Ok(RawObservation {
            indicator_key: key.to_string(),
            current_raw: non_empty(&cells[1]),
            previous_raw: non_empty(&cells[2]),
            expected_raw: forecast.expected,
            reference_period,
            next_release: forecast.next_release,
            fetched_at: self.clock.now(),
            source: Source::Scrape,
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn cell_texts(row: ElementRef<'_>) -> Vec<String> {
    let cells = selector("td, th");
    row.select(&cells)
        .map(|c| c.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

fn enclosing_row(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "tr")
}

fn href_path(href: &str) -> String {
    let end = href.find(['?', '#']).unwrap_or(href.len());
    href[..end].trim_end_matches('/').to_lowercase()
}

/// Cells of the overview row for an indicator.
///
/// Precedence: link path ending in `/{country}/{slug}`, then any link
/// containing it, then link text equal to the label, then link text
/// containing the label.
pub fn find_row(html: &str, country: &str, slug: &str, row_label: &str) -> Option<Vec<String>> {
    let doc = Html::parse_document(html);
    let anchors = selector("a");
    let needle = format!("/{country}/{slug}").to_lowercase();
    let label = row_label.trim().to_lowercase();

    let links: Vec<ElementRef<'_>> = doc.select(&anchors).collect();
    let href = |a: &ElementRef<'_>| a.value().attr("href").map(href_path);
    let text = |a: &ElementRef<'_>| {
        a.text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    };

    let passes: [&dyn Fn(&ElementRef<'_>) -> bool; 4] = [
        &|a| href(a).is_some_and(|h| h.ends_with(&needle)),
        &|a| href(a).is_some_and(|h| h.contains(&needle)),
        &|a| text(a) == label,
        &|a| text(a).contains(&label),
    ];

    passes.iter().find_map(|matches| {
        links
            .iter()
            .filter(|a| matches(a))
            .find_map(|a| enclosing_row(*a))
            .map(cell_texts)
    })
}

fn period_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z]{3})[A-Za-z]*\s*/?\s*([0-9]{4}|[0-9]{2})$").expect("static regex")
    })
}

/// First day of the month named by an overview reference cell such as
/// `Sep/25`, `Sep 2025` or `Sep2025`. Two-digit years below 70 are 20xx.
pub fn parse_reference_period(cell: &str) -> Option<NaiveDate> {
    let cleaned = cell.replace('\u{a0}', " ");
    let caps = period_pattern().captures(cleaned.trim())?;
    let year: i32 = caps[2].parse().ok()?;
    let year = match caps[2].len() {
        2 if year < 70 => 2000 + year,
        2 => 1900 + year,
        _ => year,
    };
    NaiveDate::parse_from_str(&format!("1 {} {year}", &caps[1]), "%d %b %Y").ok()
}

fn expected_phrase() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)is\s+expected\s+to\s+be\s+([-+]?[0-9]*\.?[0-9]+)").expect("static regex")
    })
}

/// What an indicator page says about the upcoming release.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Forecast {
    pub expected: Option<String>,
    pub next_release: Option<NaiveDate>,
}

/// Forecast text from an indicator page, if the page offers one.
pub fn extract_expected(html: &str) -> Option<String> {
    extract_forecast(html).expected
}

/// Forecast text and next release date from an indicator page.
///
/// The "is expected to be" sentence wins over the calendar's forecast
/// columns; the release date only ever comes from the calendar.
pub fn extract_forecast(html: &str) -> Forecast {
    let doc = Html::parse_document(html);
    let text = doc.root_element().text().collect::<Vec<_>>().join(" ");
    let upcoming = upcoming_release(&doc);

    let pick = |i: usize| {
        upcoming
            .as_ref()
            .and_then(|cells| cells.get(i))
            .and_then(|s| non_empty(s))
    };
    let expected = expected_phrase()
        .captures(&text)
        .map(|caps| caps[1].to_string())
        .or_else(|| pick(CAL_FORECAST).or_else(|| pick(CAL_CONSENSUS)));
    let next_release = pick(CAL_DATE)
        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

    Forecast {
        expected,
        next_release,
    }
}

/// Cells of the first calendar row not yet released.
fn upcoming_release(doc: &Html) -> Option<Vec<String>> {
    let tables = selector("table[id]");
    let rows = selector("tr");
    let table = doc.select(&tables).find(|t| {
        t.value()
            .attr("id")
            .is_some_and(|id| id.to_lowercase().contains("calendar"))
    })?;

    table
        .select(&rows)
        .skip(1)
        .map(cell_texts)
        .filter(|cells| cells.len() > CAL_ACTUAL)
        .find(|cells| !cells[CAL_ACTUAL].chars().any(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::http::HttpError;
    use crate::indicator::IndicatorRegistry;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OVERVIEW: &str = r#"
        <html><body><table>
          <tr><th>Labour</th><th>Last</th><th>Previous</th><th>Unit</th><th>Reference</th></tr>
          <tr><td><a href="/united-states/unemployment-rate">Unemployment Rate</a></td>
              <td>4.4</td><td>4.5</td><td>percent</td><td>Sep/25</td></tr>
          <tr><td><a href="/united-states/inflation-rate-mom">Inflation Rate MoM</a></td>
              <td>0.3</td><td>0.4</td><td>percent</td><td>Sep/25</td></tr>
          <tr><td><a href="/united-states/inflation-cpi">Inflation Rate</a></td>
              <td>2.9</td><td>2.7</td><td>percent</td><td>Sep/25</td></tr>
          <tr><td><a href="/other/place">Services PMI</a></td>
              <td>54.2</td><td>55.7</td><td>points</td><td>Oct/25</td></tr>
        </table></body></html>"#;

    struct StubHttp {
        pages: HashMap<String, Result<String, HttpError>>,
        calls: AtomicUsize,
    }

    impl StubHttp {
        fn new(pages: Vec<(&str, Result<&str, HttpError>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(u, r)| (u.to_string(), r.map(String::from)))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl HttpFetch for StubHttp {
        fn get(&self, url: &str) -> Result<String, HttpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages.get(url).cloned().unwrap_or(Err(HttpError::Status {
                status: 404,
                retry_after_secs: None,
            }))
        }
    }

    fn retriever(http: Arc<StubHttp>) -> ScrapeRetriever {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap()));
        ScrapeRetriever::with_base_url(http, clock, "https://te.test")
    }

    #[test]
    fn row_found_by_slug_not_by_prefix_label() {
        let cells = find_row(OVERVIEW, "united-states", "inflation-cpi", "Inflation Rate").unwrap();
        assert_eq!(cells[1], "2.9");
    }

    #[test]
    fn row_falls_back_to_label() {
        let cells = find_row(OVERVIEW, "united-states", "services-pmi", "Services PMI").unwrap();
        assert_eq!(cells[1..3], ["54.2".to_string(), "55.7".to_string()]);
        assert!(find_row(OVERVIEW, "united-states", "gdp-growth", "GDP Growth Rate").is_none());
    }

    #[test]
    fn expected_from_sentence() {
        let page = "<p>The unemployment rate in the United States is expected to be 4.50 percent by the end of this quarter.</p>";
        assert_eq!(extract_expected(page).as_deref(), Some("4.50"));
    }

    #[test]
    fn expected_from_calendar_forecast_then_consensus() {
        let page = r#"<table id="calendar">
            <tr><th>Date</th><th>GMT</th><th>Reference</th><th>Actual</th><th>Previous</th><th>Consensus</th><th>TEForecast</th></tr>
            <tr><td>2025-09-05</td><td>12:30</td><td>Aug</td><td>4.3%</td><td>4.2%</td><td>4.3%</td><td>4.3%</td></tr>
            <tr><td>2025-10-03</td><td>12:30</td><td>Sep</td><td></td><td>4.3%</td><td>4.3%</td><td>4.4%</td></tr>
        </table>"#;
        assert_eq!(extract_expected(page).as_deref(), Some("4.4%"));

        let consensus_only = page.replace("<td>4.4%</td></tr>", "<td></td></tr>");
        assert_eq!(extract_expected(&consensus_only).as_deref(), Some("4.3%"));
        assert_eq!(extract_expected("<p>no forecast here</p>"), None);
    }

    #[test]
    fn calendar_gives_next_release_date() {
        let page = r#"<table id="calendar">
            <tr><th>Date</th><th>GMT</th><th>Reference</th><th>Actual</th><th>Previous</th><th>Consensus</th><th>TEForecast</th></tr>
            <tr><td>2025-09-05</td><td>12:30</td><td>Aug</td><td>4.3%</td><td>4.2%</td><td>4.3%</td><td>4.3%</td></tr>
            <tr><td>2025-10-03</td><td>12:30</td><td>Sep</td><td></td><td>4.3%</td><td>4.3%</td><td>4.4%</td></tr>
        </table><p>It is expected to be 4.2 percent.</p>"#;
        let forecast = extract_forecast(page);
        assert_eq!(forecast.expected.as_deref(), Some("4.2"));
        assert_eq!(forecast.next_release, NaiveDate::from_ymd_opt(2025, 10, 3));

        assert_eq!(extract_forecast("<p>is expected to be 1.0</p>").next_release, None);
    }

    #[test]
    fn reference_period_formats() {
        let sep_2025 = NaiveDate::from_ymd_opt(2025, 9, 1);
        assert_eq!(parse_reference_period("Sep/25"), sep_2025);
        assert_eq!(parse_reference_period("Sep 2025"), sep_2025);
        assert_eq!(parse_reference_period("September2025"), sep_2025);
        assert_eq!(parse_reference_period("dec/99"), NaiveDate::from_ymd_opt(1999, 12, 1));
        assert_eq!(parse_reference_period("Q3/25"), None);
        assert_eq!(parse_reference_period("percent"), None);
        assert_eq!(parse_reference_period(""), None);
    }

    #[test]
    fn fetch_memoizes_overview_across_indicators() {
        let http = Arc::new(StubHttp::new(vec![
            ("https://te.test/united-states/indicators", Ok(OVERVIEW)),
            (
                "https://te.test/united-states/unemployment-rate",
                Ok("<p>is expected to be 4.5</p>"),
            ),
        ]));
        let r = retriever(Arc::clone(&http));
        let registry = IndicatorRegistry::builtin();

        let unemployment = r.fetch(registry.lookup("unemployment").unwrap(), "united-states").unwrap();
        assert_eq!(unemployment.current_raw.as_deref(), Some("4.4"));
        assert_eq!(unemployment.previous_raw.as_deref(), Some("4.5"));
        assert_eq!(unemployment.expected_raw.as_deref(), Some("4.5"));
        assert_eq!(unemployment.reference_period, NaiveDate::from_ymd_opt(2025, 9, 1));
        assert_eq!(unemployment.next_release, None);
        assert_eq!(unemployment.source, Source::Scrape);

        // Indicator page 404s: forecast stays absent, values survive.
        let mom = r.fetch(registry.lookup("inflation_mom").unwrap(), "united-states").unwrap();
        assert_eq!(mom.current_raw.as_deref(), Some("0.3"));
        assert_eq!(mom.expected_raw, None);

        // overview once + two indicator pages
        assert_eq!(http.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_row_is_parse_error_with_snapshot() {
        let http = Arc::new(StubHttp::new(vec![(
            "https://te.test/united-states/indicators",
            Ok(OVERVIEW),
        )]));
        let r = retriever(http);
        let registry = IndicatorRegistry::builtin();

        let err = r
            .fetch(registry.lookup("gdp_growth_qoq").unwrap(), "united-states")
            .unwrap_err();
        match err {
            FetchError::Parse { snapshot, .. } => assert!(snapshot.unwrap().contains("Unemployment Rate")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn throttled_forecast_page_propagates() {
        let http = Arc::new(StubHttp::new(vec![
            ("https://te.test/united-states/indicators", Ok(OVERVIEW)),
            (
                "https://te.test/united-states/unemployment-rate",
                Err(HttpError::Status {
                    status: 429,
                    retry_after_secs: None,
                }),
            ),
        ]));
        let r = retriever(http);
        let registry = IndicatorRegistry::builtin();

        let err = r
            .fetch(registry.lookup("unemployment").unwrap(), "united-states")
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { status: 429, .. }));
    }
}
