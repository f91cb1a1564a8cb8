//! Reconnection backoff
//!
//! Exponential backoff with a cap and an attempt limit. The connection
//! manager asks for [`ReconnectionStrategy::next_delay`] after every failed
//! or dropped connection and calls [`ReconnectionStrategy::reset`] as soon as
//! a connection opens.

use std::time::Duration;

/// Default first retry delay
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default ceiling for the retry delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(10_000);

/// Default number of consecutive attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionStrategy {
    /// Consecutive failed attempts since the last successful connection
    pub attempt: u32,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay handed out by the next call to `next_delay`
    pub current_delay: Duration,
    /// Delay the strategy starts from and returns to on reset
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::with_limits(
            INITIAL_RECONNECT_DELAY,
            MAX_RECONNECT_DELAY,
            MAX_RECONNECT_ATTEMPTS,
        )
    }
}

impl ReconnectionStrategy {
    /// Create a new reconnection strategy with the default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strategy with explicit limits
    pub fn with_limits(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        let max_delay = max_delay.max(base_delay);
        Self {
            attempt: 0,
            max_attempts,
            current_delay: base_delay,
            base_delay,
            max_delay,
        }
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.base_delay;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Get next delay with exponential backoff
    ///
    /// Returns `None` once `max_attempts` consecutive delays have been handed
    /// out without an intervening [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);

        Some(delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}/{}, next delay: {:?}",
            self.attempt, self.max_attempts, self.current_delay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut strategy = ReconnectionStrategy::with_limits(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            10,
        );

        let delays: Vec<u128> = (0..5)
            .map(|_| strategy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_fourth_attempt_after_three_failures() {
        let mut strategy = ReconnectionStrategy::with_limits(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            10,
        );

        for _ in 0..3 {
            strategy.next_delay();
        }

        assert_eq!(strategy.next_delay(), Some(Duration::from_millis(8000)));
    }

    #[test]
    fn test_fourth_attempt_respects_cap() {
        let mut strategy = ReconnectionStrategy::with_limits(
            Duration::from_millis(1000),
            Duration::from_millis(6000),
            10,
        );

        for _ in 0..3 {
            strategy.next_delay();
        }

        assert_eq!(strategy.next_delay(), Some(Duration::from_millis(6000)));
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut strategy = ReconnectionStrategy::default();
        strategy.next_delay();
        strategy.next_delay();
        strategy.next_delay();

        strategy.reset();

        assert_eq!(strategy.attempt, 0);
        assert_eq!(strategy.next_delay(), Some(INITIAL_RECONNECT_DELAY));
    }

    #[test]
    fn test_attempt_limit() {
        let mut strategy = ReconnectionStrategy::with_limits(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2,
        );

        assert!(strategy.next_delay().is_some());
        assert!(strategy.next_delay().is_some());
        assert!(!strategy.has_attempts_remaining());
        assert_eq!(strategy.next_delay(), None);
        assert!(strategy.status().starts_with("Attempt 2/2"));
    }
}
