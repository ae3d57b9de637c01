use rand::{Rng, RngCore};
use std::time::Duration;

pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // "Equal jitter": delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// How often (and how patiently) a rejected contract call is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`: doubles from `base`, capped at `max`.
    pub fn delay(&self, attempt: u32, rng: &mut impl RngCore) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let backoff = self.base.saturating_mul(factor).min(self.max);
        jittered_backoff(rng, backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(100),
            max: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = policy();
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let first = policy.delay(1, &mut rng);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let second = policy.delay(2, &mut rng);
            assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(200));
            let capped = policy.delay(40, &mut rng);
            assert!(capped >= Duration::from_millis(150) && capped <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_tiny_backoff_is_not_jittered() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            jittered_backoff(&mut rng, Duration::from_millis(1)),
            Duration::from_millis(1)
        );
    }
}
