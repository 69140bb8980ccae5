//! Bounded linear backoff used by [`FemtoBrokerTransport::reconnect`].
//!
//! [`FemtoBrokerTransport::reconnect`]: super::FemtoBrokerTransport::reconnect

use std::time::Duration;

/// Default number of consecutive failed connects before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default base delay between reconnect attempts.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Reconnect bound and delay schedule.
///
/// After the `n`th consecutive failure the transport waits `base_delay × n`
/// before trying again, so every wait is strictly longer than the previous
/// one. There is no cap beyond `max_attempts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to wait after `failures` consecutive failed attempts.
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.base_delay.saturating_mul(failures)
    }

    /// Whether `failures` consecutive failures use up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
