use std::time::Duration;

use rand::Rng;

use super::TransportConfig;

/// Capped exponential backoff for one reconnecting episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    jitter_ratio: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, max_attempts: u32, jitter_ratio: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            max_attempts,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_max_ms,
            config.max_retries,
            config.jitter_ratio,
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_ms.saturating_mul(1u64 << exp).min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Consumes one attempt and returns how long to wait before it, or `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        let ceiling = self.ceiling_for(self.attempts);
        if self.jitter_ratio == 0.0 {
            return Some(ceiling);
        }
        let shave = rng.gen_range(0.0..=self.jitter_ratio);
        Some(ceiling.mul_f64(1.0 - shave))
    }

    /// Starts a fresh episode after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(500, 3_000, 6, 0.0);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000, 3_000]);
        assert!(backoff.exhausted());
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = Backoff::new(1_000, 1_000, 50, 0.2);
        while let Some(delay) = backoff.next_delay_with(&mut rng) {
            let ms = delay.as_millis() as u64;
            assert!((799..=1_000).contains(&ms), "delay {ms} outside jitter band");
        }
        assert_eq!(backoff.attempts(), 50);
    }

    #[test]
    fn reset_restores_budget() {
        let mut backoff = Backoff::new(100, 1_000, 1, 0.0);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut backoff = Backoff::new(100, 1_000, 0, 0.0);
        assert!(backoff.exhausted());
        assert!(backoff.next_delay().is_none());
    }
}
