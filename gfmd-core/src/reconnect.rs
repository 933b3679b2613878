//! Exponential backoff for the slave-side connection supervisor
//! (design §4.6): start at a configured base interval, double on every
//! attempt, and cap at a configured maximum. The doubling is unconditional —
//! a known defect in the source only doubles the interval inside its
//! logging branch, which this implementation does not reproduce.

use std::time::Duration;

/// Backoff state tracking reconnection attempts and the next delay.
///
/// # Example
///
/// ```rust
/// use gfmd_core::reconnect::ReconnectState;
/// use std::time::Duration;
///
/// let mut backoff = ReconnectState::new(Duration::from_secs(10), Duration::from_secs(40));
///
/// assert_eq!(backoff.next_delay(), Duration::from_secs(10));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(20));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(40));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(40)); // capped
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    attempt: u32,
    current_interval: Duration,
}

impl ReconnectState {
    #[must_use]
    pub const fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Return the delay for the next reconnect attempt, then advance the
    /// internal state by doubling (capped at `max_interval`).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self.base_interval * (1_u32 << self.attempt.min(16));
        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }

        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_unconditionally_up_to_cap() {
        let mut s = ReconnectState::new(Duration::from_secs(10), Duration::from_secs(40));
        assert_eq!(s.next_delay(), Duration::from_secs(10));
        assert_eq!(s.next_delay(), Duration::from_secs(20));
        assert_eq!(s.next_delay(), Duration::from_secs(40));
        assert_eq!(s.next_delay(), Duration::from_secs(40));
        assert_eq!(s.next_delay(), Duration::from_secs(40));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut s = ReconnectState::new(Duration::from_secs(10), Duration::from_secs(40));
        s.next_delay();
        s.next_delay();
        assert_eq!(s.attempt(), 2);
        s.reset();
        assert_eq!(s.attempt(), 0);
        assert_eq!(s.next_delay(), Duration::from_secs(10));
    }
}
