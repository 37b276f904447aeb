//! Reconnection backoff policy for the Forward Worker's `Reconnecting`
//! sojourn.
//!
//! Grounded on `kube/proxy_recovery.rs`'s `ProxyRecoveryManager` backoff
//! (`min(MAX_BACKOFF_SECS, BASE_BACKOFF_SECS * 2^(attempt-1))`, slept with a
//! `tokio::select!` against a cancellation signal so the sleep is never a
//! plain, un-interruptible `sleep`), generalized per §4.4: a floor/ceiling
//! pair instead of hardcoded constants, uniform jitter in `[0, floor]`
//! added on top of the base delay, and a `reset()` the supervisor calls
//! after a 30s-or-longer `Active` sojourn.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// A successful `Active` sojourn of at least this long resets the backoff
/// to the floor, per §4.4's "Backoff policy".
pub const RESET_AFTER_ACTIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            attempt: 0,
        }
    }

    /// Base delay for the next attempt, before jitter: `min(ceiling, floor *
    /// 2^(n-1))`. Exposed separately from [`Backoff::next_delay`] so the
    /// "attempt n+1's base delay >= attempt n's base delay" invariant is
    /// directly testable without fighting jitter.
    pub fn base_delay(&self) -> Duration {
        let n = self.attempt.max(1);
        let shift = n.saturating_sub(1).min(20);
        let scaled = self.floor.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        scaled.min(self.ceiling)
    }

    /// Advances the attempt counter and returns the jittered delay to sleep
    /// for this attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let base = self.base_delay();
        let jitter = if self.floor.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..=self.floor)
        };
        base + jitter
    }

    /// Resets the attempt counter to zero after a sufficiently long `Active`
    /// sojourn. Resolver failures must *not* call this — only a successful
    /// reconnect followed by staying `Active` does.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sleeps for [`Backoff::next_delay`], cancellable via `token`. Returns
    /// `false` if cancelled before the delay elapsed.
    pub async fn sleep_cancellable(&mut self, token: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_each_attempt_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut prev = Duration::ZERO;
        for _ in 0..10 {
            backoff.attempt += 1;
            let base = backoff.base_delay();
            assert!(base >= prev, "backoff must be monotonic within a failure streak");
            prev = base;
        }
        assert_eq!(prev, Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.attempt = 10;
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        backoff.attempt += 1;
        assert_eq!(backoff.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delay_never_exceeds_base_plus_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        for _ in 0..20 {
            let base_before = {
                let mut probe = backoff.clone();
                probe.attempt += 1;
                probe.base_delay()
            };
            let delay = backoff.next_delay();
            assert!(delay >= base_before);
            assert!(delay <= base_before + Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn sleep_cancellable_returns_false_when_cancelled() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        assert!(!backoff.sleep_cancellable(&token).await);
    }
}
