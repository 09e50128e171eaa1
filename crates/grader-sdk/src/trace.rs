/// Trace / logging abstraction shared by every grader component.
///
/// Components never talk to `tracing` directly for operational messages;
/// they write through a `TraceWriter` so the same call sites can feed the
/// process log, a per-job log buffer or a test collector.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("[warning] {message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("[error] {message}"));
    }
}

/// Discards all messages.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Collects all messages into a `Vec` so tests can assert on them.
#[derive(Debug)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

/// The level of a collected trace message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// True when any collected message at `level` contains `needle`.
    pub fn contains(&self, level: TraceLevel, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

impl Default for CollectingTraceWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}
