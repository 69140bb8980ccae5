use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default minimum spacing between summary warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Helper that rate limits repeated warnings.
///
/// While the broker is down every event takes the fallback path; logging each
/// one would flood the host's own log. Callers count occurrences with
/// [`record`](Self::record) and the next [`warn_if_due`](Self::warn_if_due)
/// emits one summary once `interval` has passed. [`flush`](Self::flush)
/// reports any pending count immediately.
pub struct RateLimitedWarner {
    origin: Instant,
    interval: Duration,
    /// Milliseconds since `origin` of the last emission, offset by one so zero
    /// means "never warned".
    last_warn_ms: AtomicU64,
    pending: AtomicU64,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    /// Create a warner. The first warning is emitted immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval,
            last_warn_ms: AtomicU64::new(0),
            pending: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX - 1) + 1
    }

    /// Count one occurrence.
    pub fn record(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit a summary if the interval has elapsed since the last one.
    pub fn warn_if_due(&self, warn: impl FnOnce(u64)) {
        let now = self.now_ms();
        let prev = self.last_warn_ms.load(Ordering::Relaxed);
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        if prev != 0 && now.saturating_sub(prev) < interval_ms {
            return;
        }
        if self
            .last_warn_ms
            .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another caller is emitting this window's summary.
            return;
        }
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
        }
    }

    /// Immediately report any pending occurrences.
    pub fn flush(&self, warn: impl FnOnce(u64)) {
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RateLimitedWarner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedWarner")
            .field("interval", &self.interval)
            .field("pending", &self.pending())
            .finish()
    }
}
