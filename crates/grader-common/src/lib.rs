// grader-common: Shared services and state for the grader host.
// Depends on `grader-sdk`; everything process-wide lives here.

pub mod config;
pub mod constants;
pub mod health;
pub mod host_context;
pub mod job_logger;
pub mod load;
pub mod secret_masker;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config::{GraderConfig, LogFormat, ResourceLimits};
pub use health::HealthState;
pub use host_context::{HostContext, ShutdownReason};
pub use job_logger::JobLogger;
pub use load::{JobSlot, LoadSample, LoadTracker};
pub use secret_masker::SecretMasker;
pub use crate::tracing::{TraceEventType, TraceManager, Tracing};
