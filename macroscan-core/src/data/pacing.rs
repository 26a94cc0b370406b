//! Sleeping and request pacing.
//!
//! All waits go through a [`Sleeper`] so tests can record delays instead of
//! blocking the thread.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Blocks the current thread for a duration.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }

    pub fn total(&self) -> Duration {
        self.slept.lock().unwrap().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// Minimum spacing between successive network-issuing fetches.
///
/// The first call passes straight through; later calls wait out whatever
/// remains of `interval` since the previous pass.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Gate that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the interval has elapsed, then mark a pass.
    pub fn wait(&self, sleeper: &dyn Sleeper) {
        let mut last = self.last.lock().unwrap();
        if let Some(prev) = *last {
            let remaining = self.interval.saturating_sub(prev.elapsed());
            if !remaining.is_zero() {
                tracing::debug!(delay_ms = remaining.as_millis() as u64, "pacing request");
                sleeper.sleep(remaining);
            }
        }
        *last = Some(Instant::now());
    }
}
