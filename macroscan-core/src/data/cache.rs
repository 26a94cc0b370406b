//! Disk-backed observation cache with TTL.
//!
//! Layout: `{cache_dir}/{country}/{indicator}.json`
//!
//! Features:
//! - Atomic writes (unique temp file per write, renamed into place)
//! - BLAKE3 checksum over the stored observation, verified on read
//! - Quarantine for entries failing their checksum ({indicator}.json.quarantined)
//! - Optional time limit on every file operation
//! - Read failures degrade to a miss; write failures are logged and dropped

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

use crate::clock::Clock;
use crate::observation::Observation;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache I/O at {path} timed out after {limit:?}")]
    TimedOut {
        path: PathBuf,
        limit: std::time::Duration,
    },

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identifies one cached observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub country: String,
    pub indicator: String,
}

impl CacheKey {
    pub fn new(country: impl Into<String>, indicator: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            indicator: indicator.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.country, self.indicator)
    }
}

/// A stored observation and when it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub observation: Observation,
    pub cached_at: DateTime<Utc>,
    pub checksum: String,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }

    /// Fresh while `now - cached_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) < ttl
    }
}

/// On-disk shape. The observation is kept as raw JSON so the checksum is
/// verified against exactly the bytes that were hashed at write time.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    cached_at: DateTime<Utc>,
    checksum: String,
    observation: Box<RawValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    /// Present but unreadable, undecodable or failing its checksum.
    Unreadable,
    /// The read did not finish within the I/O time limit.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_observation(self) -> Option<Observation> {
        match self {
            Lookup::Hit(entry) => Some(entry.observation),
            Lookup::Miss(_) => None,
        }
    }
}

fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Reduce a config-supplied name to a single safe path segment.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so separators and `..`
/// cannot climb out of the directory the segment is joined onto.
pub fn path_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Why a stored file could not be turned into an entry.
#[derive(Debug)]
enum DecodeError {
    /// Not a complete entry: truncated, foreign or from an older layout.
    Undecodable(String),
    /// Parsed cleanly but the observation does not match its checksum.
    Checksum,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Undecodable(reason) => f.write_str(reason),
            DecodeError::Checksum => f.write_str("checksum mismatch"),
        }
    }
}

/// Run `op` on a helper thread and give up after `limit`.
///
/// A timed-out worker is left to finish on its own; its result is dropped.
fn bounded<T, F>(limit: Option<std::time::Duration>, op: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    let Some(limit) = limit else {
        return op();
    };
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("cache-io".into())
        .spawn(move || {
            let _ = tx.send(op());
        })?;
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("cache I/O exceeded {limit:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            "cache I/O worker exited without a result",
        )),
    }
}

/// Write `bytes` to a fresh temp file beside `path`, then rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry path has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The observation cache.
pub struct ObservationCache {
    cache_dir: PathBuf,
    clock: Arc<dyn Clock>,
    io_timeout: Option<std::time::Duration>,
}

impl ObservationCache {
    pub fn new(cache_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            clock,
            io_timeout: None,
        }
    }

    /// Bound every file read and write by `limit`.
    pub fn with_io_timeout(mut self, limit: std::time::Duration) -> Self {
        self.io_timeout = Some(limit);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn io_timeout(&self) -> Option<std::time::Duration> {
        self.io_timeout
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = path.to_path_buf();
        bounded(self.io_timeout, move || fs::read(path))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir
            .join(path_segment(&key.country))
            .join(format!("{}.json", path_segment(&key.indicator)))
    }

    /// Look up `key`; a hit requires `now - cached_at < ttl`.
    pub fn get(&self, key: &CacheKey, ttl: Duration) -> Lookup {
        let path = self.entry_path(key);
        let content = match self.read_file(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Lookup::Miss(MissReason::Absent),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                tracing::warn!(%key, path = %path.display(), error = %e, "cache read timed out");
                return Lookup::Miss(MissReason::TimedOut);
            }
            Err(e) => {
                tracing::warn!(%key, path = %path.display(), error = %e, "cache read failed");
                return Lookup::Miss(MissReason::Unreadable);
            }
        };

        let entry = match decode_entry(&content) {
            Ok(entry) if entry.key == *key => entry,
            Ok(_) => {
                tracing::warn!(%key, path = %path.display(), "cache entry key mismatch");
                return Lookup::Miss(MissReason::Unreadable);
            }
            Err(DecodeError::Checksum) => {
                quarantine(&path, "checksum mismatch");
                return Lookup::Miss(MissReason::Unreadable);
            }
            Err(reason) => {
                tracing::warn!(%key, path = %path.display(), %reason, "cache entry unreadable");
                return Lookup::Miss(MissReason::Unreadable);
            }
        };

        if entry.is_fresh(self.clock.now(), ttl) {
            Lookup::Hit(entry)
        } else {
            Lookup::Miss(MissReason::Expired)
        }
    }

    /// Store `observation` under `key` with `cached_at = now`.
    pub fn try_put(&self, key: &CacheKey, observation: &Observation) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let body = serde_json::to_string(observation)?;
        let stored = StoredEntry {
            key: key.clone(),
            cached_at: self.clock.now(),
            checksum: checksum(body.as_bytes()),
            observation: RawValue::from_string(body)?,
        };
        let json = serde_json::to_string_pretty(&stored)?;

        let target = path.clone();
        bounded(self.io_timeout, move || write_atomic(&target, json.as_bytes())).map_err(
            |source| match (source.kind(), self.io_timeout) {
                (io::ErrorKind::TimedOut, Some(limit)) => CacheError::TimedOut { path, limit },
                _ => CacheError::Io { path, source },
            },
        )
    }

    /// Store `observation`; failures are logged and swallowed.
    pub fn put(&self, key: &CacheKey, observation: &Observation) {
        if let Err(e) = self.try_put(key, observation) {
            tracing::warn!(%key, error = %e, "cache write failed");
        }
    }

    /// Remove every entry at or past expiry. Returns the number removed.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for (path, entry) in self.scan() {
            if !entry.is_fresh(now, ttl) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to evict cache entry")
                    }
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "evicted expired cache entries");
        }
        removed
    }

    /// All readable entries, ordered by key.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.scan().into_iter().map(|(_, e)| e).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn scan(&self) -> Vec<(PathBuf, CacheEntry)> {
        let Ok(countries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for country in countries.flatten() {
            let Ok(files) = fs::read_dir(country.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                // Skip temp files and .quarantined leftovers
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let decoded = self
                    .read_file(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| decode_entry(&bytes).map_err(|e| e.to_string()));
                match decoded {
                    Ok(entry) => found.push((path, entry)),
                    Err(reason) => {
                        tracing::debug!(path = %path.display(), %reason, "skipping unreadable cache file")
                    }
                }
            }
        }
        found
    }
}

fn decode_entry(bytes: &[u8]) -> Result<CacheEntry, DecodeError> {
    let stored: StoredEntry = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::Undecodable(format!("undecodable entry: {e}")))?;
    let raw = stored.observation.get();
    if checksum(raw.as_bytes()) != stored.checksum {
        return Err(DecodeError::Checksum);
    }
    let observation: Observation = serde_json::from_str(raw)
        .map_err(|e| DecodeError::Undecodable(format!("undecodable observation: {e}")))?;
    Ok(CacheEntry {
        key: stored.key,
        observation,
        cached_at: stored.cached_at,
        checksum: stored.checksum,
    })
}

fn quarantine(path: &Path, reason: &str) {
    let target = path.with_extension("json.quarantined");
    tracing::warn!(path = %path.display(), reason, "quarantining corrupt cache entry");
    let _ = fs::rename(path, target);
}
