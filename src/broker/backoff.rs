//! Reconnect backoff shared between the session and the supervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Current reconnect delay. The session escalates it on every failed connect
/// or disconnect and resets it on a successful establishment; the supervisor
/// reads it when scheduling the next attempt. There is no ceiling here, the
/// supervisor's retry-count limit halts further attempts instead.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Arc<Mutex<Duration>>,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Backoff {
            base,
            current: Arc::new(Mutex::new(base)),
        }
    }

    pub fn current(&self) -> Duration {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Doubles the delay and returns the new value.
    pub fn escalate(&self) -> Duration {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current *= 2;
        debug!("Reconnect backoff escalated to {:?}", *current);
        *current
    }

    /// Returns the delay to the baseline after a successful connect.
    pub fn reset(&self) -> Duration {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = self.base;
        debug!("Reconnect backoff reset to {:?}", *current);
        *current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_then_success() {
        let backoff = Backoff::new(Duration::from_secs(60));
        assert_eq!(backoff.current(), Duration::from_secs(60));

        backoff.escalate();
        backoff.escalate();
        let after_three = backoff.escalate();
        assert_eq!(after_three, Duration::from_secs(480));
        assert_eq!(backoff.current(), Duration::from_secs(480));

        assert_eq!(backoff.reset(), Duration::from_secs(60));
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }

    #[test]
    fn clones_share_the_same_delay() {
        let backoff = Backoff::new(Duration::from_secs(60));
        let other = backoff.clone();
        other.escalate();
        assert_eq!(backoff.current(), Duration::from_secs(120));
    }
}
