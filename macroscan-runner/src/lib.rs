//! MacroScan Runner: configuration, scan orchestration across countries, exports.
//!
//! This crate builds on `macroscan-core` to provide:
//! - TOML configuration with defaults, env override and validation
//! - Retriever selection by configured source
//! - CSV/JSON result files
//! - Debug snapshots for pages that failed extraction
//! - Run summary and pass/fail threshold

pub mod config;
pub mod debug_capture;
pub mod export;
pub mod runner;

pub use config::{ConfigError, PathsConfig, ScanConfig, API_KEY_ENV};
pub use debug_capture::FileDiagnostics;
pub use export::{export_report, ExportPaths, OutputRow};
pub use runner::{
    build_retriever, run_scan, run_scan_with, ScanError, ScanOptions, ScanSummary,
    SUCCESS_THRESHOLD,
};
