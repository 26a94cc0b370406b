//! Scan configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! scrape-mode configuration for the United States and all built-in
//! indicators.

use macroscan_core::data::RetryPolicy;
use macroscan_core::{IndicatorDescriptor, IndicatorRegistry, PipelineSettings, RegistryError, Source};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when the config has no API key.
pub const API_KEY_ENV: &str = "MACROSCAN_API_KEY";

/// Upper bound for the pacing and backoff settings, in seconds.
pub const MAX_DELAY_SECONDS: f64 = 86_400.0;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Filesystem locations used by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub debug_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("output/cache"),
            output_dir: PathBuf::from("output"),
            debug_dir: PathBuf::from("debug"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Top-level scan configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Country slug used when `countries` is empty.
    pub country: String,
    /// Several countries per run; overrides `country` when non-empty.
    pub countries: Vec<String>,
    /// Indicator keys, in output order.
    pub indicators: Vec<String>,
    pub source: Source,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    /// Minimum spacing between network requests.
    pub rate_limit_seconds: f64,
    pub cache_ttl_minutes: u64,
    pub max_attempts: u32,
    pub backoff_base_seconds: f64,
    pub max_backoff_seconds: f64,
    pub max_jitter_ms: u64,
    pub paths: PathsConfig,
    /// Extra descriptors, declared as `[[indicator]]` tables.
    #[serde(rename = "indicator", skip_serializing_if = "Vec::is_empty")]
    pub custom_indicators: Vec<IndicatorDescriptor>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            country: "united-states".into(),
            countries: Vec::new(),
            indicators: IndicatorRegistry::builtin().keys().map(String::from).collect(),
            source: Source::Scrape,
            api_key: None,
            timeout_seconds: 30,
            rate_limit_seconds: 2.0,
            cache_ttl_minutes: 60,
            max_attempts: 5,
            backoff_base_seconds: 1.0,
            max_backoff_seconds: 60.0,
            max_jitter_ms: 250,
            paths: PathsConfig::default(),
            custom_indicators: Vec::new(),
        }
    }
}

impl ScanConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Load `path` if given; otherwise `config.toml` in the working directory
    /// if present; otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let local = Path::new("config.toml");
                if local.exists() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Fill a missing API key from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                if !key.trim().is_empty() {
                    self.api_key = Some(key.trim().to_string());
                }
            }
        }
        self
    }

    /// Countries to scan, in order.
    pub fn countries(&self) -> Vec<String> {
        if self.countries.is_empty() {
            vec![self.country.clone()]
        } else {
            self.countries.clone()
        }
    }

    /// Built-in registry extended with the configured descriptors.
    pub fn registry(&self) -> Result<IndicatorRegistry, ConfigError> {
        let mut registry = IndicatorRegistry::builtin();
        for descriptor in &self.custom_indicators {
            registry.register(descriptor.clone())?;
        }
        Ok(registry)
    }

    /// Reject configurations the pipeline cannot run.
    pub fn validate(&self, registry: &IndicatorRegistry) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.indicators.is_empty() {
            return invalid("no indicators requested".into());
        }
        registry.resolve(&self.indicators)?;

        if self.countries().iter().any(|c| c.trim().is_empty()) {
            return invalid("country must not be empty".into());
        }
        if self.source == Source::Api
            && self.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return invalid(format!(
                "source 'api' requires api_key (or the {API_KEY_ENV} environment variable)"
            ));
        }
        if self.timeout_seconds == 0 {
            return invalid("timeout_seconds must be positive".into());
        }
        if self.max_attempts < 1 {
            return invalid("max_attempts must be at least 1".into());
        }
        for (name, value) in [
            ("rate_limit_seconds", self.rate_limit_seconds),
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("max_backoff_seconds", self.max_backoff_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be a non-negative number, got {value}"));
            }
            if value > MAX_DELAY_SECONDS {
                return invalid(format!("{name} must be at most {MAX_DELAY_SECONDS}, got {value}"));
            }
        }
        if self.max_jitter_ms as f64 > MAX_DELAY_SECONDS * 1000.0 {
            return invalid(format!("max_jitter_ms is too large: {}", self.max_jitter_ms));
        }
        if self.checked_cache_ttl().is_none() {
            return invalid(format!(
                "cache_ttl_minutes is too large: {}",
                self.cache_ttl_minutes
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn checked_cache_ttl(&self) -> Option<chrono::Duration> {
        i64::try_from(self.cache_ttl_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
    }

    /// Cache TTL; saturates when `cache_ttl_minutes` is out of range.
    pub fn cache_ttl(&self) -> chrono::Duration {
        self.checked_cache_ttl().unwrap_or(chrono::Duration::MAX)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: seconds(self.backoff_base_seconds),
            max_delay: seconds(self.max_backoff_seconds),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }

    /// Call after `validate`; out-of-range float fields are clamped.
    pub fn pipeline_settings(&self, refresh: bool) -> PipelineSettings {
        PipelineSettings {
            cache_ttl: self.cache_ttl(),
            retry: self.retry_policy(),
            politeness: seconds(self.rate_limit_seconds),
            refresh,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_DELAY_SECONDS)).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> ScanConfig {
        ScanConfig::from_toml_str(toml, Path::new("test.toml")).unwrap()
    }

    #[test]
    fn empty_file_is_default() {
        let config = parse("");
        assert_eq!(config, ScanConfig::default());
        assert_eq!(config.indicators.len(), 10);
        assert_eq!(config.countries(), vec!["united-states".to_string()]);
        assert_eq!(config.paths.cache_dir, PathBuf::from("output/cache"));
    }

    #[test]
    fn parses_full_file() {
        let config = parse(
            r#"
            countries = ["united-states", "germany"]
            indicators = ["unemployment", "ppi", "housing_starts"]
            source = "api"
            api_key = "guest:guest"
            timeout_seconds = 10
            rate_limit_seconds = 0.5
            cache_ttl_minutes = 15
            max_attempts = 3

            [paths]
            output_dir = "out"

            [[indicator]]
            key = "housing_starts"
            display_name = "Housing Starts"
            unit = "thousand"
            valid_range = { min = 0.0, max = 5000.0 }
            rules = [
                { type = "table_row", slug = "housing-starts", row_label = "Housing Starts" },
                { type = "category", name = "Housing Starts" },
            ]
            "#,
        );

        assert_eq!(config.source, Source::Api);
        assert_eq!(config.countries().len(), 2);
        assert_eq!(config.paths.output_dir, PathBuf::from("out"));
        assert_eq!(config.paths.debug_dir, PathBuf::from("debug"));

        let registry = config.registry().unwrap();
        config.validate(&registry).unwrap();
        assert_eq!(registry.lookup("housing_starts").unwrap().unit, "thousand");

        let settings = config.pipeline_settings(true);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.politeness, Duration::from_millis(500));
        assert_eq!(settings.cache_ttl, chrono::Duration::minutes(15));
        assert!(settings.refresh);
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let err = ScanConfig::from_toml_str("retries = 3", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_unknown_indicator() {
        let config = parse(r#"indicators = ["unemployment", "gold_price"]"#);
        let err = config.validate(&config.registry().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Registry(RegistryError::UnknownIndicator { .. })
        ));
    }

    #[test]
    fn rejects_api_without_key() {
        let config = parse(r#"source = "api""#);
        let err = config.validate(&config.registry().unwrap()).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn rejects_bad_numbers() {
        let registry = IndicatorRegistry::builtin();
        for toml in [
            "indicators = []",
            "timeout_seconds = 0",
            "max_attempts = 0",
            "rate_limit_seconds = -1.0",
            r#"country = " ""#,
        ] {
            assert!(
                parse(toml).validate(&registry).is_err(),
                "{toml} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let registry = IndicatorRegistry::builtin();
        for toml in [
            "rate_limit_seconds = 1e300",
            "backoff_base_seconds = 1e20",
            "max_backoff_seconds = 86401.0",
            "max_jitter_ms = 86400001",
            "cache_ttl_minutes = 9223372036854775",
        ] {
            let config = parse(toml);
            let err = config.validate(&registry).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn durations_never_panic_even_unvalidated() {
        let config = parse("rate_limit_seconds = 1e300\ncache_ttl_minutes = 9223372036854775");
        let settings = config.pipeline_settings(false);
        assert_eq!(settings.politeness, Duration::from_secs(86_400));
        assert_eq!(settings.cache_ttl, chrono::Duration::MAX);
    }

    #[test]
    fn largest_allowed_values_pass() {
        let config = parse("rate_limit_seconds = 86400.0\ncache_ttl_minutes = 525600");
        config.validate(&IndicatorRegistry::builtin()).unwrap();
        assert_eq!(config.cache_ttl(), chrono::Duration::days(365));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = ScanConfig::load(Path::new("/nonexistent/macroscan.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
