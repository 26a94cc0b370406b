//! Scan runner. Wires config, retriever, cache, pipeline and export.
//!
//! Two entry points:
//! - `run_scan()`: builds the HTTP client and retriever from config. Used by the CLI.
//! - `run_scan_with()`: takes a ready retriever and clock. Used by tests and replay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use macroscan_core::clock::{Clock, SystemClock};
use macroscan_core::data::{
    ApiRetriever, HttpError, HttpFetch, ObservationCache, ReqwestFetcher, Retriever,
    ScrapeRetriever,
};
use macroscan_core::pipeline::{ScanProgress, SilentProgress};
use macroscan_core::{Pipeline, PipelineError, RunReport, Source};

use crate::config::{ConfigError, ScanConfig};
use crate::debug_capture::FileDiagnostics;
use crate::export::{export_report, ExportPaths};

/// Share of requested (country, indicator) pairs that must yield a current
/// value for the run to count as successful.
pub const SUCCESS_THRESHOLD: f64 = 0.75;

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("HTTP client error: {0}")]
    Http(#[from] HttpError),
    #[error(transparent)]
    Export(#[from] anyhow::Error),
}

/// Per-invocation switches that are not part of the config file.
#[derive(Clone)]
pub struct ScanOptions {
    /// Ignore cached values (results are still cached).
    pub refresh: bool,
    pub progress: Arc<dyn ScanProgress>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            refresh: false,
            progress: Arc::new(SilentProgress),
        }
    }
}

/// Outcome of a whole scan across countries.
#[derive(Debug)]
pub struct ScanSummary {
    pub started_at: DateTime<Utc>,
    pub source: Source,
    pub reports: Vec<RunReport>,
    pub exports: Vec<ExportPaths>,
}

impl ScanSummary {
    pub fn total(&self) -> usize {
        self.reports.iter().map(RunReport::total).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.reports.iter().map(RunReport::succeeded).sum()
    }

    pub fn from_cache(&self) -> usize {
        self.reports.iter().map(RunReport::from_cache).sum()
    }

    /// Minimum successes for the run to pass: `max(1, floor(0.75 * total))`.
    pub fn required(&self) -> usize {
        ((self.total() as f64 * SUCCESS_THRESHOLD).floor() as usize).max(1)
    }

    pub fn is_success(&self) -> bool {
        self.succeeded() >= self.required()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Retriever for the configured source.
pub fn build_retriever(
    config: &ScanConfig,
    http: Arc<dyn HttpFetch>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Retriever>, ConfigError> {
    match config.source {
        Source::Scrape => Ok(Arc::new(ScrapeRetriever::new(http, clock))),
        Source::Api => {
            let key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ConfigError::Invalid("source 'api' requires api_key".into()))?;
            Ok(Arc::new(ApiRetriever::new(http, clock, key)))
        }
    }
}

/// Run a scan against the live source.
pub fn run_scan(config: &ScanConfig, options: &ScanOptions) -> Result<ScanSummary, ScanError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let http: Arc<dyn HttpFetch> = Arc::new(ReqwestFetcher::new(config.timeout())?);
    let retriever = build_retriever(config, http, clock.clone())?;
    run_scan_with(config, retriever, clock, options)
}

/// Run a scan with an explicit retriever and clock.
pub fn run_scan_with(
    config: &ScanConfig,
    retriever: Arc<dyn Retriever>,
    clock: Arc<dyn Clock>,
    options: &ScanOptions,
) -> Result<ScanSummary, ScanError> {
    let registry = config.registry()?;
    config.validate(&registry)?;

    let countries = config.countries();
    let multi_country = countries.len() > 1;
    let source = retriever.source();
    let started_at = clock.now();

    let cache = Arc::new(
        ObservationCache::new(&config.paths.cache_dir, clock.clone()).with_io_timeout(config.timeout()),
    );
    let pipeline = Pipeline::new(
        Arc::new(registry),
        retriever,
        cache,
        config.pipeline_settings(options.refresh),
    )
    .with_clock(clock.clone())
    .with_diagnostics(Arc::new(FileDiagnostics::new(&config.paths.debug_dir, clock)))
    .with_progress(options.progress.clone());

    let mut reports = Vec::with_capacity(countries.len());
    let mut exports = Vec::with_capacity(countries.len());
    for country in &countries {
        let report = pipeline.run(country, &config.indicators)?;
        exports.push(export_report(&config.paths.output_dir, &report, source, multi_country)?);
        reports.push(report);
    }

    let summary = ScanSummary {
        started_at,
        source,
        reports,
        exports,
    };
    tracing::info!(
        countries = countries.len(),
        succeeded = summary.succeeded(),
        total = summary.total(),
        required = summary.required(),
        "run finished"
    );
    Ok(summary)
}
