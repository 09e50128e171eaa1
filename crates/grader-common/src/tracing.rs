// Per-component trace sources with secret masking.

use crate::secret_masker::SecretMasker;
use grader_sdk::TraceWriter;
use std::sync::Arc;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// A named trace source that masks secrets before emitting log lines.
///
/// Each component gets its own `Tracing` instance; they all share the same
/// `SecretMasker`. Events go to the `tracing` crate with the component name
/// as a structured field, so both the text and JSON formatters keep it.
#[derive(Clone)]
pub struct Tracing {
    name: Arc<str>,
    secret_masker: Arc<SecretMasker>,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: Arc<SecretMasker>) -> Self {
        Self {
            name: Arc::from(name.into()),
            secret_masker,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        let component = &*self.name;
        match event_type {
            TraceEventType::Error => tracing::error!(component = component, "{}", masked),
            TraceEventType::Warning => tracing::warn!(component = component, "{}", masked),
            TraceEventType::Information => tracing::info!(component = component, "{}", masked),
            TraceEventType::Verbose => tracing::debug!(component = component, "{}", masked),
        }
    }

    /// Log a serialized object as info JSON.
    pub fn info_object<T: serde::Serialize>(&self, item: &T) {
        match serde_json::to_string_pretty(item) {
            Ok(json) => self.info(&json),
            Err(e) => self.info(&format!("<serialization error: {e}>")),
        }
    }

    /// Log an error with its whole cause chain.
    pub fn error_chain(&self, context: &str, err: &anyhow::Error) {
        self.error(&format!("{context}: {err:#}"));
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named trace sources that share one `SecretMasker`.
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
}

impl TraceManager {
    pub fn new(secret_masker: Arc<SecretMasker>) -> Self {
        Self { secret_masker }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone())
    }
}
