//! Snapshot capture for pages that failed extraction.
//!
//! Files are named `{country}_{indicator}_{YYYYmmdd_HHMMSS}.html` and start
//! with comment lines recording the URL and the failure reason.

use macroscan_core::clock::Clock;
use macroscan_core::data::{path_segment, DiagnosticSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FileDiagnostics {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileDiagnostics {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, country: &str, indicator: &str) -> PathBuf {
        let stamp = self.clock.now().format("%Y%m%d_%H%M%S");
        self.dir.join(format!(
            "{}_{}_{stamp}.html",
            path_segment(country),
            path_segment(indicator)
        ))
    }
}

impl DiagnosticSink for FileDiagnostics {
    fn capture(&self, country: &str, indicator: &str, url: &str, reason: &str, snapshot: &str) {
        let path = self.path_for(country, indicator);
        // "--" would close the header comment early
        let body = format!(
            "<!-- URL: {} -->\n<!-- Reason: {} -->\n{snapshot}",
            url.replace("--", "- -"),
            reason.replace("--", "- -"),
        );
        let written = std::fs::create_dir_all(&self.dir).and_then(|()| std::fs::write(&path, body));
        match written {
            Ok(()) => tracing::info!(path = %path.display(), indicator, "saved debug snapshot"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save debug snapshot"),
        }
    }
}
