//! Numeric cleaning and per-indicator validation.
//!
//! Failure isolation is per field: a malformed or implausible value turns
//! into an absent field plus a [`ValidationNote`], never into an error.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::indicator::{IndicatorDescriptor, ValidRange};
use crate::observation::{delta, Observation, RawObservation};

/// Which of the three raw fields a note refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Current,
    Previous,
    Expected,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Current => "current",
            Field::Previous => "previous",
            Field::Expected => "expected",
        })
    }
}

/// Why a field was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Unparseable,
    OutOfRange { value: f64, range: ValidRange },
}

/// Field-level validation skip, surfaced through logging only.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationNote {
    pub indicator_key: String,
    pub field: Field,
    pub raw: String,
    pub reason: SkipReason,
}

impl fmt::Display for ValidationNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            SkipReason::Unparseable => write!(
                f,
                "{} {}: '{}' is not a number",
                self.indicator_key, self.field, self.raw
            ),
            SkipReason::OutOfRange { value, range } => write!(
                f,
                "{} {}: {} outside [{}, {}]",
                self.indicator_key, self.field, value, range.min, range.max
            ),
        }
    }
}

/// Normalizer output: the observation plus any skipped-field notes.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub observation: Observation,
    pub notes: Vec<ValidationNote>,
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?[0-9]*\.?[0-9]+").expect("static regex"))
}

/// Parse a display string such as `"4.40%"`, `"52.5 points"` or
/// `"1,234.5"` into a number. `unit` is stripped as well when given.
pub fn parse_number(raw: &str, unit: &str) -> Option<f64> {
    let mut s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    let unit = unit.trim().to_lowercase();
    if !unit.is_empty() {
        s = s.replace(&unit, "");
    }
    s = s
        .replace('%', "")
        .replace("points", "")
        .replace("point", "")
        .replace([',', '\u{a0}'], "")
        .replace(['\u{2013}', '\u{2014}', '\u{2212}'], "-");
    s.retain(|c| !c.is_whitespace());

    number_pattern()
        .find(&s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn clean_field(
    raw: Option<&str>,
    field: Field,
    descriptor: &IndicatorDescriptor,
    notes: &mut Vec<ValidationNote>,
) -> Option<f64> {
    let raw = raw?;
    let note = |reason| ValidationNote {
        indicator_key: descriptor.key.clone(),
        field,
        raw: raw.to_string(),
        reason,
    };

    let Some(value) = parse_number(raw, &descriptor.unit) else {
        notes.push(note(SkipReason::Unparseable));
        return None;
    };

    if let Some(range) = descriptor.valid_range {
        if !range.contains(value) {
            notes.push(note(SkipReason::OutOfRange { value, range }));
            return None;
        }
    }
    Some(value)
}

/// Turn raw fragments into a validated observation. Never fails.
///
/// A field that was absent at the source stays absent without a note; a
/// field that was present but unusable becomes absent with a note.
pub fn normalize(raw: &RawObservation, descriptor: &IndicatorDescriptor) -> Normalized {
    let mut notes = Vec::new();
    let current = clean_field(raw.current_raw.as_deref(), Field::Current, descriptor, &mut notes);
    let previous = clean_field(raw.previous_raw.as_deref(), Field::Previous, descriptor, &mut notes);
    let expected = clean_field(raw.expected_raw.as_deref(), Field::Expected, descriptor, &mut notes);

    Normalized {
        observation: Observation {
            indicator_key: raw.indicator_key.clone(),
            current,
            previous,
            expected,
            difference: delta(current, previous),
            surprise: delta(current, expected),
            reference_period: raw.reference_period,
            next_release: raw.next_release,
            timestamp_utc: raw.fetched_at,
            source: raw.source,
        },
        notes,
    }
}
