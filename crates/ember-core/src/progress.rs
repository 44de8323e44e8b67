//! Rate-limited progress messages for hot loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Minimum spacing between progress messages.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Admits at most one message per interval, shared between threads.
///
/// The timestamp is read and reset with relaxed atomics and no
/// compare-and-swap, so two threads may both pass within the same interval
/// once in a while. An occasional extra log line is acceptable; contention in
/// the calling loop is not.
#[derive(Debug)]
pub struct ProgressLimiter {
    start: Instant,
    interval_ms: u64,
    /// Milliseconds since `start` at the last admitted message.
    last_ms: AtomicU64,
}

impl ProgressLimiter {
    /// The first message is admitted one interval after construction.
    pub fn new(interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(0),
        }
    }

    /// Whether a message may be emitted now; restarts the interval if so.
    pub fn ready(&self) -> bool {
        let now = self.start.elapsed().as_millis() as u64;
        if now.saturating_sub(self.last_ms.load(Ordering::Relaxed)) >= self.interval_ms {
            self.last_ms.store(now, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl Default for ProgressLimiter {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}
