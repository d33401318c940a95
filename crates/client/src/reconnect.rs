//! Exponential-backoff reconnection policy for the progress socket.
//!
//! When the socket drops, the session loop asks [`ReconnectPolicy`] how
//! long to wait before the next attempt. The n-th consecutive failure
//! waits `base_delay * 2^(n-1)`. At most `max_attempts` reconnects are
//! scheduled; when the last of them fails the policy gives up and the
//! monitor goes quiet.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Reconnect attempts scheduled before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after `failures` consecutive failures, or `None` when
    /// the policy has given up.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(failures - 1)?;
        self.base_delay.checked_mul(factor)
    }
}

/// Consecutive-failure counter driven by the socket session loop.
#[derive(Debug, Default)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    /// Record a failure and return the delay before the next attempt, or
    /// `None` when no further attempt should be scheduled.
    pub fn on_failure(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        policy.delay_for(self.failures)
    }

    /// A connection opened successfully.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_three_delays_double() {
        let policy = ReconnectPolicy::default();
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..3)
            .map(|_| backoff.on_failure(&policy).unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        let mut backoff = Backoff::default();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.on_failure(&policy))
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(backoff.on_failure(&policy), None);
        assert_eq!(backoff.on_failure(&policy), None);
    }

    #[test]
    fn reset_restarts_sequence() {
        let policy = ReconnectPolicy::default();
        let mut backoff = Backoff::default();
        backoff.on_failure(&policy);
        backoff.on_failure(&policy);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(
            backoff.on_failure(&policy),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn custom_base_delay() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(25_600)));
        assert_eq!(policy.delay_for(11), None);
    }
}
