//! Indicator registry: declarative descriptors keyed by indicator.
//!
//! Each supported indicator is an immutable value record describing where
//! its numbers live at the source and which values are plausible. Retrieval
//! code never branches on indicator keys; adding an indicator means adding
//! a descriptor (in code via [`IndicatorRegistry::register`] or as an
//! `[[indicator]]` table in the config file).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Registry lookup and registration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown indicator '{key}'")]
    UnknownIndicator { key: String },

    #[error("indicator '{key}' is already registered")]
    Duplicate { key: String },

    #[error("invalid descriptor for '{key}': {reason}")]
    InvalidDescriptor { key: String, reason: String },
}

/// Inclusive plausibility bounds for an indicator's values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// How one retrieval strategy locates an indicator at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionRule {
    /// Row of the country's indicator overview table. The row is found by a
    /// link whose href contains `/{country}/{slug}`, falling back to a link
    /// whose text contains `row_label`. The slug also names the indicator's
    /// own page, where the forecast is read.
    TableRow { slug: String, row_label: String },

    /// Entry of the API country snapshot whose `Category` field matches.
    Category { name: String },
}

/// Static metadata describing how to retrieve and validate one indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDescriptor {
    pub key: String,
    pub display_name: String,
    pub rules: Vec<ExtractionRule>,
    #[serde(default)]
    pub valid_range: Option<ValidRange>,
    #[serde(default)]
    pub unit: String,
}

impl IndicatorDescriptor {
    /// The table-row rule used by the scrape strategy, if any.
    pub fn table_row(&self) -> Option<(&str, &str)> {
        self.rules.iter().find_map(|r| match r {
            ExtractionRule::TableRow { slug, row_label } => Some((slug.as_str(), row_label.as_str())),
            _ => None,
        })
    }

    /// The category rule used by the API strategy, if any.
    pub fn category(&self) -> Option<&str> {
        self.rules.iter().find_map(|r| match r {
            ExtractionRule::Category { name } => Some(name.as_str()),
            _ => None,
        })
    }

    fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidDescriptor {
            key: self.key.clone(),
            reason: reason.to_string(),
        };
        if self.key.trim().is_empty() {
            return Err(invalid("key is empty"));
        }
        if self.rules.is_empty() {
            return Err(invalid("no extraction rules"));
        }
        if let Some(range) = self.valid_range {
            if !(range.min <= range.max) {
                return Err(invalid("valid_range min exceeds max"));
            }
        }
        Ok(())
    }
}

/// Built-in descriptor: overview row label doubles as the API category.
fn builtin(
    key: &str,
    display_name: &str,
    row_label: &str,
    slug: &str,
    range: (f64, f64),
    unit: &str,
) -> IndicatorDescriptor {
    IndicatorDescriptor {
        key: key.to_string(),
        display_name: display_name.to_string(),
        rules: vec![
            ExtractionRule::TableRow {
                slug: slug.to_string(),
                row_label: row_label.to_string(),
            },
            ExtractionRule::Category {
                name: row_label.to_string(),
            },
        ],
        valid_range: Some(ValidRange::new(range.0, range.1)),
        unit: unit.to_string(),
    }
}

/// Ordered, read-only table of indicator descriptors.
#[derive(Debug, Clone, Default)]
pub struct IndicatorRegistry {
    descriptors: Vec<IndicatorDescriptor>,
    index: HashMap<String, usize>,
}

impl IndicatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the supported macro indicators.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let table = [
            builtin("unemployment", "Unemployment", "Unemployment Rate", "unemployment-rate", (0.0, 30.0), "%"),
            builtin("inflation_mom", "Inflation MoM", "Inflation Rate MoM", "inflation-rate-mom", (-10.0, 10.0), "%"),
            builtin("inflation_yoy", "Inflation YoY", "Inflation Rate", "inflation-cpi", (-10.0, 50.0), "%"),
            builtin("interest_rate", "Interest Rate", "Interest Rate", "interest-rate", (0.0, 30.0), "%"),
            builtin("retail_sales_mom", "Retail Sales MoM", "Retail Sales MoM", "retail-sales-mom", (-50.0, 50.0), "%"),
            builtin("retail_sales_yoy", "Retail Sales YoY", "Retail Sales YoY", "retail-sales-yoy", (-50.0, 100.0), "%"),
            builtin("services_pmi", "Services PMI", "Services PMI", "services-pmi", (0.0, 100.0), "points"),
            builtin("manufacturing_pmi", "Manufacturing PMI", "Manufacturing PMI", "manufacturing-pmi", (0.0, 100.0), "points"),
            builtin("ppi", "PPI", "Producer Price Inflation MoM", "producer-price-inflation-mom", (-20.0, 20.0), "%"),
            builtin("gdp_growth_qoq", "GDP Growth QoQ", "GDP Growth Rate", "gdp-growth", (-50.0, 50.0), "%"),
        ];
        for descriptor in table {
            let registered = registry.register(descriptor);
            debug_assert!(registered.is_ok(), "built-in indicator rejected: {registered:?}");
        }
        registry
    }

    /// Add a descriptor. Keys are unique.
    pub fn register(&mut self, descriptor: IndicatorDescriptor) -> Result<(), RegistryError> {
        descriptor.check()?;
        if self.index.contains_key(&descriptor.key) {
            return Err(RegistryError::Duplicate {
                key: descriptor.key,
            });
        }
        self.index
            .insert(descriptor.key.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Descriptor for `key`, or `UnknownIndicator`.
    pub fn lookup(&self, key: &str) -> Result<&IndicatorDescriptor, RegistryError> {
        self.index
            .get(key)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| RegistryError::UnknownIndicator {
                key: key.to_string(),
            })
    }

    /// Resolve every key, failing on the first unknown one.
    pub fn resolve<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<Vec<&IndicatorDescriptor>, RegistryError> {
        keys.iter().map(|k| self.lookup(k.as_ref())).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndicatorDescriptor> {
        self.descriptors.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
