// JobLogger: per-job log that is both forwarded to the process log and
// buffered for upload as the job's `output.log`.

use crate::constants::grading::CONTAINER_LOG_PREFIX;
use crate::secret_masker::SecretMasker;
use chrono::Utc;
use grader_sdk::TraceWriter;
use parking_lot::Mutex;
use std::sync::Arc;

/// Buffered bytes kept per job; container output past this is dropped.
pub const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct Buffer {
    text: String,
    truncated: bool,
}

/// Collects every line logged for one job.
///
/// Each buffered line is prefixed with a UTC timestamp and its level. Once
/// `MAX_BUFFERED_BYTES` is reached a single truncation marker is written and
/// further lines only reach the process log.
pub struct JobLogger {
    job_id: String,
    secret_masker: Arc<SecretMasker>,
    buffer: Mutex<Buffer>,
}

impl JobLogger {
    pub fn new(job_id: impl Into<String>, secret_masker: Arc<SecretMasker>) -> Self {
        Self {
            job_id: job_id.into(),
            secret_masker,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// A line of container stdout/stderr.
    pub fn container_line(&self, line: &str) {
        let line = format!("{CONTAINER_LOG_PREFIX}{line}");
        tracing::debug!(job_id = %self.job_id, "{}", line);
        self.append("INFO", &line);
    }

    /// Log a serialized object at info level.
    pub fn info_object<T: serde::Serialize>(&self, item: &T) {
        match serde_json::to_string_pretty(item) {
            Ok(json) => self.info(&json),
            Err(e) => self.info(&format!("<serialization error: {e}>")),
        }
    }

    /// Everything buffered so far.
    pub fn contents(&self) -> String {
        self.buffer.lock().text.clone()
    }

    fn append(&self, level: &str, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        let line = format!(
            "{} {level} {masked}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );

        let mut buffer = self.buffer.lock();
        if buffer.truncated {
            return;
        }
        if buffer.text.len() + line.len() > MAX_BUFFERED_BYTES {
            buffer.truncated = true;
            buffer
                .text
                .push_str("[log truncated: output exceeded the size limit]\n");
            return;
        }
        buffer.text.push_str(&line);
    }
}

impl TraceWriter for JobLogger {
    fn info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, "{}", self.secret_masker.mask_secrets(message));
        self.append("INFO", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(job_id = %self.job_id, "{}", self.secret_masker.mask_secrets(message));
        self.append("DEBUG", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, "{}", self.secret_masker.mask_secrets(message));
        self.append("WARN", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(job_id = %self.job_id, "{}", self.secret_masker.mask_secrets(message));
        self.append("ERROR", message);
    }
}
