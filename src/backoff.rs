use std::time::Duration;

use rand::Rng;

const DEFAULT_MIN: Duration = Duration::from_millis(100);
const DEFAULT_MAX: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Decorrelated-jitter exponential backoff.
///
/// Each interval is drawn uniformly from `[min, current * multiplier]`
/// and clamped to `[min, max]`, so concurrent clients do not retry in
/// lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
    multiplier: f64,
    max_retries: u32,
    current: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN, DEFAULT_MAX, DEFAULT_MULTIPLIER, DEFAULT_MAX_RETRIES)
    }
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            min,
            max,
            multiplier,
            max_retries,
            current: min,
        }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(DEFAULT_MIN, DEFAULT_MAX, DEFAULT_MULTIPLIER, max_retries)
    }

    /// Draw the next sleep interval and advance the policy state.
    pub fn next_interval(&mut self) -> Duration {
        let upper = self.current.as_secs_f64() * self.multiplier;
        let candidate = rand::thread_rng().gen_range(self.min.as_secs_f64()..=upper);
        let clamped = candidate.clamp(self.min.as_secs_f64(), self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(clamped);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Whether another attempt should follow `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
