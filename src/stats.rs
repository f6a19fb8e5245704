//! Transfer statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics for one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Byte offset the attempt started from (non-zero when resuming).
    pub resumed_from: u64,
    /// Bytes received during this attempt.
    pub bytes_received: u64,
    /// Wall-clock duration of the attempt.
    pub elapsed: Duration,
    /// Average speed in bytes per second.
    pub average_speed: u64,
    /// Peak speed in bytes per second.
    pub peak_speed: u64,
}

/// Internal helper for tracking statistics while a transfer runs.
#[derive(Debug)]
pub struct TransferStatsTracker {
    start_time: Instant,
    resumed_from: AtomicU64,
    received: AtomicU64,
    peak_speed: AtomicU64,
}

impl Default for TransferStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStatsTracker {
    /// Starts tracking now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            resumed_from: AtomicU64::new(0),
            received: AtomicU64::new(0),
            peak_speed: AtomicU64::new(0),
        }
    }

    /// Records the offset the transfer resumes from.
    pub fn set_resumed_from(&self, offset: u64) {
        self.resumed_from.store(offset, Ordering::Relaxed);
    }

    /// Records received bytes and returns the current speed in bytes/sec.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn record_bytes(&self, bytes: u64) -> u64 {
        let total = self.received.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs > 0.0 {
            let speed = (total as f64 / secs) as u64;
            self.peak_speed.fetch_max(speed, Ordering::Relaxed);
            speed
        } else {
            0
        }
    }

    /// Returns the elapsed time since tracking started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns the statistics gathered so far.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn snapshot(&self) -> TransferStats {
        let elapsed = self.elapsed();
        let bytes_received = self.received.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        let average_speed = if secs > 0.0 {
            (bytes_received as f64 / secs) as u64
        } else {
            0
        };
        TransferStats {
            resumed_from: self.resumed_from.load(Ordering::Relaxed),
            bytes_received,
            elapsed,
            average_speed,
            peak_speed: self.peak_speed.load(Ordering::Relaxed),
        }
    }
}
