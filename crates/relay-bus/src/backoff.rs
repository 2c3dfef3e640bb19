//! Reconnect delays for a lost bus subscription.

use rand::Rng;
use std::time::Duration;

/// Relative spread applied around each delay.
const JITTER: f64 = 0.25;

/// Grows a base delay geometrically up to a ceiling and hands out jittered
/// copies of it.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    floor: Duration,
    ceiling: Duration,
    factor: f64,
    base: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial`, multiplied by `factor` after
    /// each attempt and capped at `max`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chord_relay_bus::ExponentialBackoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(500),
    ///     Duration::from_secs(30),
    ///     2.0,
    /// );
    /// let delay = backoff.next_delay();
    /// assert!(delay >= Duration::from_millis(375));
    /// assert!(delay <= Duration::from_millis(625));
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            floor: initial,
            ceiling: max,
            factor,
            base: initial,
            failures: 0,
        }
    }

    /// Jittered copy of the current base delay. The base then grows for the
    /// next call.
    pub fn next_delay(&mut self) -> Duration {
        let spread = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        let delay = scale(self.base, spread).unwrap_or(self.base);

        self.base = scale(self.base, self.factor)
            .map_or(self.ceiling, |grown| grown.min(self.ceiling));
        self.failures = self.failures.saturating_add(1);

        delay
    }

    /// Number of delays handed out since creation or the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.failures
    }

    /// Go back to the initial delay.
    pub fn reset(&mut self) {
        self.base = self.floor;
        self.failures = 0;
    }
}

/// `duration * by`, or `None` when the product does not fit in a `Duration`.
fn scale(duration: Duration, by: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(duration.as_secs_f64() * by).ok()
}
