//! Truncated exponential backoff
//!
//! Used by the kill wait: poll a condition, doubling the delay between polls
//! up to a ceiling, and give up after one failed poll at the ceiling.

use std::time::Duration;
use tracing::debug;

/// Polls a condition under truncated exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffHelper {
    initial: Duration,
    max: Duration,
}

impl BackoffHelper {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Polls `condition` until it returns true.
    ///
    /// Returns `true` once the condition holds, or `false` after the condition
    /// has failed following a sleep at the maximum delay. The first check runs
    /// before any sleep. Cancellation is dropping the returned future.
    pub async fn do_until_success<F>(&self, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        if condition() {
            return true;
        }

        let mut delay = self.initial;
        loop {
            let at_max = delay >= self.max;
            debug!(delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;

            if condition() {
                return true;
            }
            if at_max {
                return false;
            }
            delay = std::cmp::min(delay * 2, self.max);
        }
    }
}
