// Process-wide health state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// Healthy until the first call to `flag_unhealthy`, unhealthy forever after.
///
/// The reason is written before the flag flips, so a reader that observes
/// `is_healthy() == false` always finds a reason. The first reason wins.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    reason: OnceLock<String>,
    became_unhealthy: CancellationToken,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            reason: OnceLock::new(),
            became_unhealthy: CancellationToken::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Why the host is unhealthy, once it is.
    pub fn reason(&self) -> Option<&str> {
        if self.is_healthy() {
            None
        } else {
            self.reason.get().map(String::as_str)
        }
    }

    /// Mark the host unhealthy. Returns `true` only for the call that made
    /// the transition.
    pub fn flag_unhealthy(&self, reason: impl Into<String>) -> bool {
        let first = self.reason.set(reason.into()).is_ok();
        self.healthy.store(false, Ordering::Release);
        if first {
            tracing::error!(
                reason = self.reason.get().map(String::as_str).unwrap_or_default(),
                "Host flagged unhealthy"
            );
            self.became_unhealthy.cancel();
        }
        first
    }

    /// Resolves once the host has been flagged unhealthy.
    pub async fn unhealthy(&self) {
        self.became_unhealthy.cancelled().await;
    }
}
