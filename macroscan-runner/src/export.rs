//! CSV and JSON export of scan results.
//!
//! One row per requested indicator, in request order. Failed indicators
//! still get a row: empty values, the run timestamp, and the error text in
//! the JSON `Error` field.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use macroscan_core::data::path_segment;
use macroscan_core::{Outcome, RunReport, Source};
use serde::Serialize;
use serde_json::value::RawValue;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: [&str; 7] = [
    "Indicator",
    "Current",
    "Previous",
    "Difference",
    "Expected Future",
    "TimestampUTC",
    "Source",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One output row, independent of format.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub indicator: String,
    pub current: Option<f64>,
    pub previous: Option<f64>,
    pub difference: Option<f64>,
    pub expected: Option<f64>,
    pub timestamp_utc: DateTime<Utc>,
    pub source: Source,
    pub error: Option<String>,
}

/// Rows for a report. `source` stamps rows for failed indicators.
pub fn rows(report: &RunReport, source: Source) -> Vec<OutputRow> {
    report
        .outcomes
        .iter()
        .map(|o| match &o.outcome {
            Outcome::Observed { observation, .. } => OutputRow {
                indicator: o.display_name.clone(),
                current: observation.current,
                previous: observation.previous,
                difference: observation.difference,
                expected: observation.expected,
                timestamp_utc: observation.timestamp_utc,
                source: observation.source,
                error: None,
            },
            Outcome::Failed { error, .. } => OutputRow {
                indicator: o.display_name.clone(),
                current: None,
                previous: None,
                difference: None,
                expected: None,
                timestamp_utc: report.started_at,
                source,
                error: Some(format!("{}: {error}", error.kind().as_str())),
            },
        })
        .collect()
}

/// Fixed two-decimal text; absent is empty.
pub fn format_value(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn write_csv(path: &Path, rows: &[OutputRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV {}", path.display()))?;
    wtr.write_record(CSV_HEADER)?;
    for row in rows {
        wtr.write_record([
            row.indicator.clone(),
            format_value(row.current),
            format_value(row.previous),
            format_value(row.difference),
            format_value(row.expected),
            format_timestamp(row.timestamp_utc),
            row.source.to_string(),
        ])?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write CSV {}", path.display()))?;
    Ok(())
}

#[derive(Serialize)]
struct JsonRow<'a> {
    #[serde(rename = "Indicator")]
    indicator: &'a str,
    #[serde(rename = "Current")]
    current: Option<Box<RawValue>>,
    #[serde(rename = "Previous")]
    previous: Option<Box<RawValue>>,
    #[serde(rename = "Difference")]
    difference: Option<Box<RawValue>>,
    #[serde(rename = "Expected Future")]
    expected: Option<Box<RawValue>>,
    #[serde(rename = "TimestampUTC")]
    timestamp_utc: String,
    #[serde(rename = "Source")]
    source: &'static str,
    #[serde(rename = "Error")]
    error: Option<&'a str>,
}

/// JSON number with exactly two decimals.
fn fixed2(value: Option<f64>) -> Result<Option<Box<RawValue>>> {
    value
        .map(|v| RawValue::from_string(format!("{v:.2}")))
        .transpose()
        .context("Failed to format number")
}

pub fn write_json(path: &Path, rows: &[OutputRow]) -> Result<()> {
    let json_rows = rows
        .iter()
        .map(|row| -> Result<JsonRow<'_>> {
            Ok(JsonRow {
                indicator: &row.indicator,
                current: fixed2(row.current)?,
                previous: fixed2(row.previous)?,
                difference: fixed2(row.difference)?,
                expected: fixed2(row.expected)?,
                timestamp_utc: format_timestamp(row.timestamp_utc),
                source: row.source.as_str(),
                error: row.error.as_deref(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let json = serde_json::to_string_pretty(&json_rows).context("Failed to serialize rows")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write JSON {}", path.display()))?;
    Ok(())
}

/// Paths written for one country.
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub country: String,
    pub csv: PathBuf,
    pub json: PathBuf,
}

/// `latest_macro.{csv,json}`, or `latest_macro_{country}.*` when several
/// countries share the output directory.
pub fn file_stem(country: &str, multi_country: bool) -> String {
    if multi_country {
        format!("latest_macro_{}", path_segment(country))
    } else {
        "latest_macro".to_string()
    }
}

/// Write both formats for one report.
pub fn export_report(
    output_dir: &Path,
    report: &RunReport,
    source: Source,
    multi_country: bool,
) -> Result<ExportPaths> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let stem = file_stem(&report.country, multi_country);
    let csv = output_dir.join(format!("{stem}.csv"));
    let json = output_dir.join(format!("{stem}.json"));

    let rows = rows(report, source);
    write_csv(&csv, &rows)?;
    write_json(&json, &rows)?;
    tracing::info!(csv = %csv.display(), json = %json.display(), rows = rows.len(), "exported results");

    Ok(ExportPaths {
        country: report.country.clone(),
        csv,
        json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use macroscan_core::data::FetchError;
    use macroscan_core::{IndicatorOutcome, Observation};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 3, 14, 30, 5).unwrap()
    }

    fn report() -> RunReport {
        RunReport {
            country: "united-states".into(),
            started_at: ts(),
            outcomes: vec![
                IndicatorOutcome {
                    indicator_key: "unemployment".into(),
                    display_name: "Unemployment".into(),
                    outcome: Outcome::Observed {
                        observation: Observation {
                            indicator_key: "unemployment".into(),
                            current: Some(4.4),
                            previous: Some(4.5),
                            expected: None,
                            difference: Some(4.4 - 4.5),
                            surprise: None,
                            reference_period: None,
                            next_release: None,
                            timestamp_utc: ts(),
                            source: Source::Scrape,
                        },
                        from_cache: false,
                        notes: Vec::new(),
                    },
                },
                IndicatorOutcome {
                    indicator_key: "inflation_mom".into(),
                    display_name: "Inflation MoM".into(),
                    outcome: Outcome::Failed {
                        error: FetchError::NotFound {
                            indicator: "inflation_mom".into(),
                            url: "https://te.test".into(),
                        },
                        attempts: 1,
                    },
                },
            ],
        }
    }

    #[test]
    fn values_have_two_decimals() {
        assert_eq!(format_value(Some(4.4)), "4.40");
        assert_eq!(format_value(Some(4.4 - 4.5)), "-0.10");
        assert_eq!(format_value(None), "");
        assert_eq!(format_timestamp(ts()), "2025-10-03T14:30:05Z");
    }

    #[test]
    fn failed_rows_keep_position_and_source() {
        let rows = rows(&report(), Source::Scrape);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].indicator, "Inflation MoM");
        assert_eq!(rows[1].current, None);
        assert_eq!(rows[1].timestamp_utc, ts());
        assert!(rows[1].error.as_deref().unwrap().starts_with("NotFound"));
    }

    #[test]
    fn stems_depend_on_country_count() {
        assert_eq!(file_stem("germany", false), "latest_macro");
        assert_eq!(file_stem("germany", true), "latest_macro_germany");
        assert_eq!(file_stem("../x", true), "latest_macro____x");
    }

    #[test]
    fn hostile_country_exports_inside_output_dir() {
        // GIVEN a multi-country run where one country slug carries "../"
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut hostile = report();
        hostile.country = "../x".into();

        // WHEN the report is exported
        let paths = export_report(&out, &hostile, Source::Scrape, true).unwrap();

        // THEN both files sit directly in the output dir
        assert_eq!(paths.csv, out.join("latest_macro____x.csv"));
        assert_eq!(paths.json.parent(), Some(out.as_path()));
        assert!(!dir.path().join("x.csv").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn csv_and_json_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = export_report(dir.path(), &report(), Source::Scrape, false).unwrap();

        let csv = std::fs::read_to_string(&paths.csv).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Indicator,Current,Previous,Difference,Expected Future,TimestampUTC,Source")
        );
        assert_eq!(
            lines.next(),
            Some("Unemployment,4.40,4.50,-0.10,,2025-10-03T14:30:05Z,scrape")
        );
        assert_eq!(lines.next(), Some("Inflation MoM,,,,,2025-10-03T14:30:05Z,scrape"));

        let json = std::fs::read_to_string(&paths.json).unwrap();
        assert!(json.contains("\"Current\": 4.40"));
        assert!(json.contains("\"Difference\": -0.10"));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["Expected Future"], serde_json::Value::Null);
        assert_eq!(parsed[0]["Error"], serde_json::Value::Null);
        assert!(parsed[1]["Error"].as_str().unwrap().contains("not available"));
    }
}
