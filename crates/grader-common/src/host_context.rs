// HostContext: process-wide services shared by every worker loop.

use crate::config::GraderConfig;
use crate::health::HealthState;
use crate::load::LoadTracker;
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

use grader_sdk::TraceWriter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the host stopped taking work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM, typically from the fleet scaling in.
    Terminated,
    /// SIGINT / Ctrl-C.
    Interrupted,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Terminated => write!(f, "SIGTERM"),
            ShutdownReason::Interrupted => write!(f, "SIGINT"),
        }
    }
}

/// The central application context.
///
/// Holds the configuration, the trace manager and the shared state that
/// worker loops, the health monitor and the drain manager coordinate
/// through: `HealthState`, `LoadTracker` and the shutdown token whose
/// cancellation means "terminating".
pub struct HostContext {
    config: Arc<GraderConfig>,

    /// Cancelled once a termination signal has been received.
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,

    pub secret_masker: Arc<SecretMasker>,
    trace_manager: TraceManager,

    health: Arc<HealthState>,
    load: Arc<LoadTracker>,
}

impl HostContext {
    /// Build the context and register configuration secrets with the masker.
    pub fn new(config: GraderConfig) -> Arc<Self> {
        let secret_masker = Arc::new(SecretMasker::new());
        if let Some(password) = config.postgresql_password.as_deref() {
            secret_masker.add_value(password);
        }
        let trace_manager = TraceManager::new(secret_masker.clone());
        let load = Arc::new(LoadTracker::new(config.max_concurrent_jobs));

        Arc::new(Self {
            config: Arc::new(config),
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            secret_masker,
            trace_manager,
            health: Arc::new(HealthState::new()),
            load,
        })
    }

    pub fn config(&self) -> &Arc<GraderConfig> {
        &self.config
    }

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn load(&self) -> &Arc<LoadTracker> {
        &self.load
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Cancelled when the host starts draining.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_terminating(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Stop taking new work. Only the first reason is kept.
    pub fn begin_shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.shutdown_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        self.get_trace("HostContext")
            .info(&format!("Received {reason}, draining in-flight jobs"));
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_password_is_masked() {
        let config = GraderConfig {
            postgresql_password: Some("pg-secret".into()),
            ..GraderConfig::default()
        };
        let context = HostContext::new(config);
        assert_eq!(context.secret_masker.mask_secrets("pw=pg-secret"), "pw=***");
        assert_eq!(context.load().max_jobs(), 5);
    }

    #[test]
    fn first_shutdown_reason_is_kept() {
        let context = HostContext::new(GraderConfig::default());
        assert!(!context.is_terminating());
        context.begin_shutdown(ShutdownReason::Terminated);
        context.begin_shutdown(ShutdownReason::Interrupted);
        assert!(context.is_terminating());
        assert_eq!(context.shutdown_reason(), Some(ShutdownReason::Terminated));
        assert!(context.shutdown_token().is_cancelled());
    }
}
