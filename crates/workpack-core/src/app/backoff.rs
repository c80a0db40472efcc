//! Backoff policy: decides how long retry loops sleep.

use std::time::Duration;

use rand::Rng;

/// Delays used by the claim, lock and connect retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Lower bound (inclusive) of the randomized claim delay.
    pub claim_min: Duration,

    /// Upper bound (exclusive) of the randomized claim delay.
    pub claim_max: Duration,

    /// Fixed delay between lock attempts.
    pub lock_interval: Duration,

    /// Fixed delay between attempts to reach the store.
    pub connect_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            claim_min: Duration::from_secs(2),
            claim_max: Duration::from_secs(10),
            lock_interval: Duration::from_secs(10),
            connect_interval: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Millisecond-scale delays, for tests and single-process demos.
    pub fn fast() -> Self {
        Self {
            claim_min: Duration::from_millis(5),
            claim_max: Duration::from_millis(20),
            lock_interval: Duration::from_millis(5),
            connect_interval: Duration::from_millis(5),
        }
    }

    /// Random delay in `[claim_min, claim_max)`.
    ///
    /// Spreads out claimants that all found the same task blocked, so they do
    /// not hit the store in lockstep. A degenerate range yields `claim_min`.
    pub fn claim_delay(&self) -> Duration {
        if self.claim_max <= self.claim_min {
            return self.claim_min;
        }
        rand::thread_rng().gen_range(self.claim_min..self.claim_max)
    }
}
