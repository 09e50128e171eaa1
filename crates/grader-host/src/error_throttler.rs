// Exponential backoff (1s to 60s) for transport errors while polling the
// jobs queue.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Each call to `increment_and_wait` sleeps for the current delay and then
/// doubles it, capped at 60s. `reset` after any successful call.
pub struct ErrorThrottler {
    current_delay: Duration,
}

impl ErrorThrottler {
    pub fn new() -> Self {
        Self {
            current_delay: MIN_BACKOFF,
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Sleep for the current delay, then grow it.
    ///
    /// Returns `false` if `cancel` fired before the delay elapsed.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay;
        tracing::warn!(
            "Error throttling: waiting {:.1}s before retry",
            delay.as_secs_f64()
        );

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };

        self.increment();
        completed
    }

    fn increment(&mut self) {
        self.current_delay = (self.current_delay * BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
    }
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new()
    }
}
