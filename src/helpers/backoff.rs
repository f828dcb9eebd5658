use rand::Rng;
use std::time::Duration;

/// Iterator over exponentially growing delays
///
/// Every call to `next` yields the delay to wait before the following attempt. The first value
/// equals the initial delay, every subsequent one is multiplied by the multiplier until the cap
/// is reached. Once `limit` delays have been handed out, the iterator is exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: f64,
    current: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retries: 0,
            limit: 13,
            multiplier: 2.0,
            current: Duration::from_millis(25),
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Creates a backoff starting at `initial`, growing by `multiplier` and capped at `max`
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            current: initial,
            multiplier,
            max,
            ..Default::default()
        }
    }

    /// Limits the number of delays handed out
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Spreads every delay randomly by up to ±10%
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after the given failed attempt (1-based) without advancing the iterator
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.current.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_nanos() as f64);

        self.spread(Duration::from_nanos(capped as u64))
    }

    fn spread(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let nanos = delay.as_nanos() as f64;
        let range = nanos * 0.1;
        let offset = rand::thread_rng().gen_range(-range..=range);

        Duration::from_nanos((nanos + offset).max(0.0) as u64)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            None
        } else {
            Some(self.delay(self.retries))
        }
    }
}
