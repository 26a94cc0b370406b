//! Pipeline orchestrator: cache check, retrieval with retry, normalization,
//! write-through, per indicator and strictly in order.
//!
//! Per-indicator state machine:
//!
//! ```text
//! Pending -> CacheCheck -> Hit ------------------------------> Done
//!                       -> Miss -> Fetching -> FetchFailed --> Done(error)
//!                                           -> FetchOk -> Validating -> Cached -> Done
//! ```
//!
//! A failing indicator never stops its siblings; only an unknown indicator
//! key aborts, and it does so before any network activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::data::cache::{CacheKey, Lookup, ObservationCache};
use crate::data::pacing::{RateGate, Sleeper, ThreadSleeper};
use crate::data::provider::{DiagnosticSink, DiscardDiagnostics, FetchError, Retriever};
use crate::data::retry::{call_with_retry, RetryPolicy};
use crate::indicator::{IndicatorDescriptor, IndicatorRegistry, RegistryError};
use crate::normalize::{normalize, ValidationNote};
use crate::observation::Observation;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown indicator '{key}'")]
    UnknownIndicator { key: String },

    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for PipelineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownIndicator { key } => PipelineError::UnknownIndicator { key },
            other => PipelineError::Registry(other),
        }
    }
}

/// Knobs for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cache_ttl: chrono::Duration,
    pub retry: RetryPolicy,
    /// Minimum spacing between network-issuing fetches.
    pub politeness: Duration,
    /// Skip the cache check (results are still written through).
    pub refresh: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: chrono::Duration::minutes(60),
            retry: RetryPolicy::default(),
            politeness: Duration::from_secs(2),
            refresh: false,
        }
    }
}

/// Terminal state of one indicator.
#[derive(Debug, Clone)]
pub enum Outcome {
    Observed {
        observation: Observation,
        from_cache: bool,
        notes: Vec<ValidationNote>,
    },
    Failed {
        error: FetchError,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
pub struct IndicatorOutcome {
    pub indicator_key: String,
    pub display_name: String,
    pub outcome: Outcome,
}

impl IndicatorOutcome {
    pub fn observation(&self) -> Option<&Observation> {
        match &self.outcome {
            Outcome::Observed { observation, .. } => Some(observation),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.outcome {
            Outcome::Failed { error, .. } => Some(error),
            Outcome::Observed { .. } => None,
        }
    }

    pub fn from_cache(&self) -> bool {
        matches!(self.outcome, Outcome::Observed { from_cache: true, .. })
    }

    /// A headline value was obtained.
    pub fn has_current(&self) -> bool {
        self.observation().is_some_and(Observation::has_current)
    }
}

/// Ordered outcomes for one country.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub country: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<IndicatorOutcome>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.has_current()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error().is_some()).count()
    }

    pub fn from_cache(&self) -> usize {
        self.outcomes.iter().filter(|o| o.from_cache()).count()
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.outcomes.iter().filter_map(IndicatorOutcome::observation)
    }
}

/// Progress callbacks, one pair per indicator.
pub trait ScanProgress: Send + Sync {
    fn on_start(&self, country: &str, indicator: &str, index: usize, total: usize);
    fn on_complete(&self, country: &str, outcome: &IndicatorOutcome, index: usize, total: usize);
}

/// Progress reporter that reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ScanProgress for SilentProgress {
    fn on_start(&self, _: &str, _: &str, _: usize, _: usize) {}
    fn on_complete(&self, _: &str, _: &IndicatorOutcome, _: usize, _: usize) {}
}

/// Sequential fetch pipeline over one retriever and one cache.
pub struct Pipeline {
    registry: Arc<IndicatorRegistry>,
    retriever: Arc<dyn Retriever>,
    cache: Arc<ObservationCache>,
    settings: PipelineSettings,
    gate: RateGate,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn DiagnosticSink>,
    progress: Arc<dyn ScanProgress>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<IndicatorRegistry>,
        retriever: Arc<dyn Retriever>,
        cache: Arc<ObservationCache>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gate: RateGate::new(settings.politeness),
            registry,
            retriever,
            cache,
            settings,
            sleeper: Arc::new(ThreadSleeper),
            clock: Arc::new(SystemClock),
            diagnostics: Arc::new(DiscardDiagnostics),
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ScanProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run every key in order for `country`.
    pub fn run<S: AsRef<str>>(&self, country: &str, keys: &[S]) -> Result<RunReport, PipelineError> {
        let descriptors = self.registry.resolve(keys)?;
        let started_at = self.clock.now();
        let total = descriptors.len();
        tracing::info!(
            country,
            indicators = total,
            source = %self.retriever.source(),
            refresh = self.settings.refresh,
            "starting scan"
        );

        let mut outcomes = Vec::with_capacity(total);
        for (i, descriptor) in descriptors.into_iter().enumerate() {
            self.progress.on_start(country, &descriptor.key, i, total);
            let outcome = IndicatorOutcome {
                indicator_key: descriptor.key.clone(),
                display_name: descriptor.display_name.clone(),
                outcome: self.process(descriptor, country),
            };
            self.progress.on_complete(country, &outcome, i, total);
            outcomes.push(outcome);
        }

        let report = RunReport {
            country: country.to_string(),
            started_at,
            outcomes,
        };
        tracing::info!(
            country,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cached = report.from_cache(),
            total,
            "scan complete"
        );
        Ok(report)
    }

    fn process(&self, descriptor: &IndicatorDescriptor, country: &str) -> Outcome {
        let key = CacheKey::new(country, &descriptor.key);

        if !self.settings.refresh {
            match self.cache.get(&key, self.settings.cache_ttl) {
                Lookup::Hit(entry) => {
                    tracing::debug!(%key, cached_at = %entry.cached_at, "cache hit");
                    return Outcome::Observed {
                        observation: entry.observation,
                        from_cache: true,
                        notes: Vec::new(),
                    };
                }
                Lookup::Miss(reason) => tracing::debug!(%key, ?reason, "cache miss"),
            }
        }

        let fetched = call_with_retry(&self.settings.retry, self.sleeper.as_ref(), |attempt| {
            self.gate.wait(self.sleeper.as_ref());
            tracing::debug!(%key, attempt, retriever = self.retriever.name(), "fetching");
            self.retriever.fetch(descriptor, country)
        });

        match fetched {
            Ok(raw) => {
                let normalized = normalize(&raw, descriptor);
                for note in &normalized.notes {
                    tracing::warn!(country, "validation skip: {note}");
                }
                self.cache.put(&key, &normalized.observation);
                Outcome::Observed {
                    observation: normalized.observation,
                    from_cache: false,
                    notes: normalized.notes,
                }
            }
            Err(failure) => {
                if let FetchError::Parse {
                    url,
                    reason,
                    snapshot: Some(snapshot),
                    ..
                } = &failure.last_error
                {
                    self.diagnostics
                        .capture(country, &descriptor.key, url, reason, snapshot);
                }
                tracing::error!(
                    %key,
                    kind = failure.last_error.kind().as_str(),
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "indicator failed"
                );
                Outcome::Failed {
                    error: failure.last_error,
                    attempts: failure.attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::pacing::RecordingSleeper;
    use crate::observation::{RawObservation, Source};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted retriever: each key pops responses in order, the last repeats.
    struct Scripted {
        clock: Arc<ManualClock>,
        script: Mutex<HashMap<String, Vec<Result<[Option<&'static str>; 3], FetchError>>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                script: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn script(self, key: &str, steps: Vec<Result<[Option<&'static str>; 3], FetchError>>) -> Self {
            self.script.lock().unwrap().insert(key.to_string(), steps);
            self
        }
    }

    impl Retriever for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn source(&self) -> Source {
            Source::Scrape
        }

        fn fetch(&self, d: &IndicatorDescriptor, _country: &str) -> Result<RawObservation, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let steps = script.get_mut(&d.key).expect("unscripted indicator");
            let step = if steps.len() > 1 { steps.remove(0) } else { steps[0].clone() };
            step.map(|[c, p, e]| RawObservation {
                indicator_key: d.key.clone(),
                current_raw: c.map(String::from),
                previous_raw: p.map(String::from),
                expected_raw: e.map(String::from),
                reference_period: None,
                next_release: None,
                fetched_at: self.clock.now(),
                source: Source::Scrape,
            })
        }
    }

    fn limited() -> FetchError {
        FetchError::RateLimited {
            url: "https://x".into(),
            status: 429,
            retry_after_secs: None,
        }
    }

    fn settings(max_attempts: u32) -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_jitter: Duration::ZERO,
            },
            politeness: Duration::ZERO,
            ..PipelineSettings::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        cache: Arc<ObservationCache>,
        sleeper: Arc<RecordingSleeper>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 3, 12, 0, 0).unwrap()));
        let cache = Arc::new(ObservationCache::new(dir.path(), clock.clone()));
        Fixture {
            _dir: dir,
            clock,
            cache,
            sleeper: Arc::new(RecordingSleeper::new()),
        }
    }

    fn pipeline(f: &Fixture, retriever: Arc<Scripted>, settings: PipelineSettings) -> Pipeline {
        Pipeline::new(Arc::new(IndicatorRegistry::builtin()), retriever, f.cache.clone(), settings)
            .with_sleeper(f.sleeper.clone())
            .with_clock(f.clock.clone())
    }

    #[test]
    fn unknown_key_aborts_before_fetching() {
        let f = fixture();
        let retriever = Arc::new(Scripted::new(f.clock.clone()));
        let p = pipeline(&f, retriever.clone(), settings(3));

        let err = p.run("united-states", &["unemployment", "gold"]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownIndicator { key } if key == "gold"));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rate_limited_then_success_is_retried() {
        let f = fixture();
        let retriever = Arc::new(
            Scripted::new(f.clock.clone()).script(
                "ppi",
                vec![Err(limited()), Err(limited()), Ok([Some("0.4%"), Some("0.1%"), None])],
            ),
        );
        let p = pipeline(&f, retriever.clone(), settings(3));

        let report = p.run("united-states", &["ppi"]).unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.sleeper.delays(), vec![Duration::from_millis(10), Duration::from_millis(20)]);
    }

    #[test]
    fn exhausted_retries_report_attempts() {
        let f = fixture();
        let retriever = Arc::new(Scripted::new(f.clock.clone()).script("ppi", vec![Err(limited())]));
        let p = pipeline(&f, retriever, settings(2));

        let report = p.run("united-states", &["ppi"]).unwrap();
        match &report.outcomes[0].outcome {
            Outcome::Failed { attempts, error } => {
                assert_eq!(*attempts, 2);
                assert_eq!(error.kind().as_str(), "RateLimited");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn refresh_bypasses_cache_but_writes_through() {
        let f = fixture();
        let retriever = Arc::new(
            Scripted::new(f.clock.clone())
                .script("ppi", vec![Ok([Some("0.4"), None, None]), Ok([Some("0.6"), None, None])]),
        );
        let first = pipeline(&f, retriever.clone(), settings(1));
        first.run("united-states", &["ppi"]).unwrap();

        let refresh = PipelineSettings {
            refresh: true,
            ..settings(1)
        };
        let second = pipeline(&f, retriever.clone(), refresh);
        let report = second.run("united-states", &["ppi"]).unwrap();

        assert!(!report.outcomes[0].from_cache());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
        let cached = f
            .cache
            .get(&CacheKey::new("united-states", "ppi"), chrono::Duration::minutes(60))
            .into_observation()
            .unwrap();
        assert_eq!(cached.current, Some(0.6));
    }

    #[test]
    fn parse_snapshot_goes_to_diagnostics() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<(String, String)>>);
        impl DiagnosticSink for Collect {
            fn capture(&self, country: &str, indicator: &str, _: &str, _: &str, snapshot: &str) {
                self.0
                    .lock()
                    .unwrap()
                    .push((format!("{country}/{indicator}"), snapshot.to_string()));
            }
        }

        let f = fixture();
        let retriever = Arc::new(Scripted::new(f.clock.clone()).script(
            "ppi",
            vec![Err(FetchError::Parse {
                indicator: "ppi".into(),
                url: "https://x".into(),
                reason: "row missing".into(),
                snapshot: Some("<html/>".into()),
            })],
        ));
        let sink = Arc::new(Collect::default());
        let p = pipeline(&f, retriever, settings(5)).with_diagnostics(sink.clone());

        let report = p.run("united-states", &["ppi"]).unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![("united-states/ppi".to_string(), "<html/>".to_string())]
        );
    }

    #[test]
    fn politeness_applies_only_between_network_fetches() {
        // GIVEN unemployment already cached from an earlier unpaced run
        let f = fixture();
        let retriever = Arc::new(
            Scripted::new(f.clock.clone())
                .script("unemployment", vec![Ok([Some("4.4"), Some("4.5"), None])])
                .script("ppi", vec![Ok([Some("0.4"), Some("0.1"), None])])
                .script("interest_rate", vec![Ok([Some("4.25"), Some("4.5"), None])]),
        );
        pipeline(&f, retriever.clone(), settings(1))
            .run("united-states", &["unemployment"])
            .unwrap();
        assert!(f.sleeper.delays().is_empty());

        // WHEN a paced run puts the cached key between two misses
        let interval = Duration::from_secs(60);
        let paced = PipelineSettings {
            politeness: interval,
            ..settings(1)
        };
        let report = pipeline(&f, retriever.clone(), paced)
            .run("united-states", &["ppi", "unemployment", "interest_rate"])
            .unwrap();

        // THEN the cached key costs no network call
        assert_eq!(report.succeeded(), 3);
        assert!(report.outcomes[1].from_cache());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 3);

        // AND the gate waited once, before the second network fetch only
        let delays = f.sleeper.delays();
        assert_eq!(delays.len(), 1, "{delays:?}");
        assert!(delays[0] <= interval);
        assert!(delays[0] > interval - Duration::from_secs(5));
    }
}
