//! MacroScan CLI: scans, indicator listing and cache management.
//!
//! Commands:
//! - `run`: fetch the configured indicators and write latest_macro CSV/JSON
//! - `indicators`: list the registered indicators
//! - `cache status`: list cached observations with age and expiry
//! - `cache evict`: remove expired cache entries

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use macroscan_core::clock::SystemClock;
use macroscan_core::data::ObservationCache;
use macroscan_core::pipeline::ScanProgress;
use macroscan_core::{ExtractionRule, IndicatorOutcome, Outcome, Source};
use macroscan_runner::export::format_value;
use macroscan_runner::{run_scan, ScanConfig, ScanOptions, ScanSummary};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "macroscan",
    about = "MacroScan: macroeconomic indicator scanner"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./config.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level output on stderr (RUST_LOG takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch indicators and write latest_macro CSV/JSON.
    Run {
        /// Retrieval source: api or scrape.
        #[arg(long)]
        source: Option<Source>,

        /// Country slug (repeatable), e.g. united-states.
        #[arg(long = "country")]
        countries: Vec<String>,

        /// Indicator key (repeatable). Defaults to the configured list.
        #[arg(long = "indicator")]
        indicators: Vec<String>,

        /// Ignore cached values (fresh results are still cached).
        #[arg(long, default_value_t = false)]
        refresh: bool,

        /// Output directory for result files.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// List registered indicators.
    Indicators,
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached observations with age and expiry.
    Status,
    /// Remove entries older than the configured TTL.
    Evict,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScanConfig::load_or_default(cli.config.as_deref())?.with_env_overrides();

    match cli.command {
        Commands::Run {
            source,
            countries,
            indicators,
            refresh,
            output_dir,
        } => {
            let mut config = config;
            if let Some(source) = source {
                config.source = source;
            }
            if !countries.is_empty() {
                config.countries = countries;
            }
            if !indicators.is_empty() {
                config.indicators = indicators;
            }
            if let Some(dir) = output_dir {
                config.paths.output_dir = dir;
            }
            logging::init(Some(&config.paths.log_dir), cli.verbose)?;
            run_cmd(&config, refresh)
        }
        Commands::Indicators => {
            logging::init(None, cli.verbose)?;
            run_indicators(&config)
        }
        Commands::Cache { action } => {
            logging::init(None, cli.verbose)?;
            match action {
                CacheAction::Status => run_cache_status(&config),
                CacheAction::Evict => run_cache_evict(&config),
            }
        }
    }
}

/// Progress reporter that prints to stdout.
struct StdoutProgress;

impl ScanProgress for StdoutProgress {
    fn on_start(&self, country: &str, indicator: &str, index: usize, total: usize) {
        println!("[{}/{}] {country} {indicator}...", index + 1, total);
    }

    fn on_complete(&self, _country: &str, outcome: &IndicatorOutcome, _index: usize, _total: usize) {
        match &outcome.outcome {
            Outcome::Observed { from_cache: true, .. } => println!("  CACHED: {}", outcome.indicator_key),
            Outcome::Observed { .. } => println!("  OK: {}", outcome.indicator_key),
            Outcome::Failed { error, attempts } => {
                println!("  FAIL: {} after {attempts} attempt(s): {error}", outcome.indicator_key)
            }
        }
    }
}

fn run_cmd(config: &ScanConfig, refresh: bool) -> Result<()> {
    let options = ScanOptions {
        refresh,
        progress: Arc::new(StdoutProgress),
    };
    let summary = run_scan(config, &options).context("scan failed")?;

    print_summary(&summary);
    for paths in &summary.exports {
        println!("Saved: {} and {}", paths.csv.display(), paths.json.display());
    }

    let code = summary.exit_code();
    if code != 0 {
        eprintln!(
            "Only {}/{} indicators returned a value (need {})",
            summary.succeeded(),
            summary.total(),
            summary.required()
        );
        std::process::exit(code);
    }
    Ok(())
}

fn print_summary(summary: &ScanSummary) {
    println!();
    println!(
        "{:<14} {:<18} {:>9} {:>9} {:>9} {:>9} {:>9}  {:<8} {:<10}  {}",
        "Country", "Indicator", "Current", "Previous", "Diff", "Expected", "Surprise", "Period",
        "Next", "Status"
    );
    println!("{}", "-".repeat(120));
    for report in &summary.reports {
        for outcome in &report.outcomes {
            let (values, dates, status) = match &outcome.outcome {
                Outcome::Observed {
                    observation,
                    from_cache,
                    notes,
                } => {
                    let status = match (from_cache, notes.len()) {
                        (true, _) => "cached".to_string(),
                        (false, 0) => "ok".to_string(),
                        (false, n) => format!("ok ({n} skipped)"),
                    };
                    (
                        [
                            observation.current,
                            observation.previous,
                            observation.difference,
                            observation.expected,
                            observation.surprise,
                        ],
                        (observation.reference_period, observation.next_release),
                        status,
                    )
                }
                Outcome::Failed { error, .. } => {
                    ([None; 5], (None, None), error.kind().as_str().to_string())
                }
            };
            let period = dates
                .0
                .map(|d| d.format("%b %Y").to_string())
                .unwrap_or_default();
            let next = dates
                .1
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            println!(
                "{:<14} {:<18} {:>9} {:>9} {:>9} {:>9} {:>9}  {:<8} {:<10}  {}",
                report.country,
                outcome.display_name,
                format_value(values[0]),
                format_value(values[1]),
                format_value(values[2]),
                format_value(values[3]),
                format_value(values[4]),
                period,
                next,
                status
            );
        }
    }
    println!();
    println!(
        "Source: {}  Succeeded: {}/{}  From cache: {}",
        summary.source,
        summary.succeeded(),
        summary.total(),
        summary.from_cache()
    );
}

fn run_indicators(config: &ScanConfig) -> Result<()> {
    let registry = config.registry()?;
    println!(
        "{:<20} {:<20} {:<8} {:<16} {}",
        "Key", "Name", "Unit", "Range", "Locators"
    );
    println!("{}", "-".repeat(100));
    for d in registry.iter() {
        let range = d
            .valid_range
            .map(|r| format!("{} to {}", r.min, r.max))
            .unwrap_or_else(|| "-".into());
        let locators: Vec<String> = d
            .rules
            .iter()
            .map(|r| match r {
                ExtractionRule::TableRow { slug, .. } => format!("scrape:{slug}"),
                ExtractionRule::Category { name } => format!("api:{name}"),
            })
            .collect();
        println!(
            "{:<20} {:<20} {:<8} {:<16} {}",
            d.key,
            d.display_name,
            d.unit,
            range,
            locators.join(", ")
        );
    }
    Ok(())
}

fn run_cache_status(config: &ScanConfig) -> Result<()> {
    let cache_dir = &config.paths.cache_dir;
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let cache = ObservationCache::new(cache_dir, Arc::new(SystemClock)).with_io_timeout(config.timeout());
    let entries = cache.entries();
    if entries.is_empty() {
        println!("Cache is empty: {}", cache_dir.display());
        return Ok(());
    }

    let now = chrono::Utc::now();
    let ttl = config.cache_ttl();
    let fresh = entries.iter().filter(|e| e.is_fresh(now, ttl)).count();

    println!("Cache: {}", cache_dir.display());
    println!("Entries: {} ({fresh} fresh, TTL {} min)", entries.len(), ttl.num_minutes());
    println!();
    println!("{:<36} {:<22} {:>10} {:>12}", "Key", "Cached At (UTC)", "Age", "Expires In");
    println!("{}", "-".repeat(84));
    for entry in &entries {
        let age = entry.age(now);
        let expires = if entry.is_fresh(now, ttl) {
            format_minutes((ttl - age).num_minutes())
        } else {
            "expired".into()
        };
        println!(
            "{:<36} {:<22} {:>10} {:>12}",
            entry.key.to_string(),
            entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
            format_minutes(age.num_minutes()),
            expires
        );
    }
    Ok(())
}

fn run_cache_evict(config: &ScanConfig) -> Result<()> {
    let cache_dir = &config.paths.cache_dir;
    if !cache_dir.exists() {
        println!("Cache directory does not exist: {}", cache_dir.display());
        return Ok(());
    }

    let cache = ObservationCache::new(cache_dir, Arc::new(SystemClock)).with_io_timeout(config.timeout());
    let removed = cache.evict_expired(config.cache_ttl());
    println!("Evicted {removed} expired entr{}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

fn format_minutes(minutes: i64) -> String {
    if minutes >= 60 * 24 {
        format!("{}d {}h", minutes / (60 * 24), (minutes / 60) % 24)
    } else if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}
