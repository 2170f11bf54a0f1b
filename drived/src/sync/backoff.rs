use rand::Rng;
use std::time::Duration;

const MAX_BACKOFF_FACTOR: u32 = 16;

/// Exponential delay between polls after consecutive failures.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Backoff for a poll loop running every `interval`: failures stretch the
    /// wait up to sixteen intervals.
    pub fn for_poll_interval(interval: Duration) -> Self {
        Self::new(interval, interval.saturating_mul(MAX_BACKOFF_FACTOR), true)
    }

    /// Delay after `failures` consecutive failures; `0` is the regular wait.
    pub fn delay(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(failures, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = failures.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        // The regular interval is never jittered.
        let delay_ms = if self.jitter && failures > 0 {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}
