//! Exponential backoff for outbound provider calls.
//!
//! The generation core never talks to the network itself, but the planner,
//! writer, patcher and memory collaborators it hosts do. This crate carries
//! the one retry contract they all share: timeout-class failures back off
//! exponentially (base 2, capped, jittered) for a bounded number of
//! attempts, and every other failure surfaces on the first attempt.
//!
//! # Example
//!
//! ```
//! use fabula_retry::{Backoff, Retry};
//!
//! let backoff = Backoff::immediate(3);
//! let result: Result<u32, Retry<&str>> = backoff.run(|attempt| {
//!     if attempt < 3 {
//!         Err(Retry::Transient("provider timed out"))
//!     } else {
//!         Ok(attempt)
//!     }
//! });
//! assert_eq!(result.unwrap(), 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failed attempt should be treated by the retry loop.
#[derive(Debug)]
pub enum Retry<E> {
    /// Timed out or lost connectivity; another attempt may succeed.
    Transient(E),
    /// Retrying cannot help; surface immediately.
    Permanent(E),
}

impl<E> Retry<E> {
    /// The wrapped error, regardless of classification.
    pub fn into_inner(self) -> E {
        match self {
            Retry::Transient(e) | Retry::Permanent(e) => e,
        }
    }
}

/// An exponential backoff schedule.
///
/// The delay before retry `n` is `base_delay * 2^(n-1)`, capped at
/// `max_delay`, then jittered. `max_attempts` counts the first try, so a
/// schedule of 1 never sleeps and never retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each retry after it.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Randomization factor in `0.0..=1.0`: each delay is drawn uniformly
    /// from within that fraction around its nominal value.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

impl Backoff {
    /// A single attempt: no retries, no sleeping.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// `max_attempts` tries with zero delay in between. Meant for tests and
    /// call sites that must not block.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// The delay to sleep after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(doublings))
            .min(self.max_delay);
        jittered(nominal, self.jitter)
    }

    /// Drive `op` until it succeeds, fails permanently, or the schedule is
    /// exhausted. The operation receives the attempt number (starting at 1)
    /// and classifies each failure itself.
    ///
    /// An `Err(Retry::Transient(_))` from this function means the schedule
    /// ran out on a transient failure; `Err(Retry::Permanent(_))` means the
    /// operation refused to be retried. Callers use the distinction to pick
    /// between degrading and propagating.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, Retry<E>>
    where
        F: FnMut(u32) -> Result<T, Retry<E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Retry::Permanent(e)) => return Err(Retry::Permanent(e)),
                Err(Retry::Transient(e)) => {
                    if attempt >= attempts {
                        return Err(Retry::Transient(e));
                    }
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

/// Spread a delay uniformly across `(1 - jitter) .. (1 + jitter)` of its
/// nominal value, so synchronized callers do not retry in lockstep.
fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    use rand::Rng;
    let spread: f64 = rand::thread_rng().gen_range(-jitter..=jitter);
    let millis = (delay.as_millis() as f64 * (1.0 + spread)).round().max(0.0) as u64;
    Duration::from_millis(millis)
}
