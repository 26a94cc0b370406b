//! MacroScan Core: the macro indicator fetch pipeline.
//!
//! This crate contains:
//! - Indicator registry (declarative descriptors, built-in table)
//! - Retrieval strategies behind the `Retriever` trait (API snapshot, page scrape)
//! - Retry/backoff controller and request pacing
//! - Disk-backed observation cache with TTL
//! - Numeric cleaning and range validation
//! - Sequential orchestrator tying the above together

pub mod clock;
pub mod data;
pub mod indicator;
pub mod normalize;
pub mod observation;
pub mod pipeline;

pub use indicator::{ExtractionRule, IndicatorDescriptor, IndicatorRegistry, RegistryError, ValidRange};
pub use observation::{Observation, RawObservation, Source};
pub use pipeline::{IndicatorOutcome, Outcome, Pipeline, PipelineError, PipelineSettings, RunReport};
