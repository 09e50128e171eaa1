// Grading job wire format and validation.

use grader_common::constants::grading::{CONTAINER_DIRECTORY, HARD_TIMEOUT_MULTIPLIER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted job timeout; a queue message cannot stay hidden longer.
pub const MAX_TIMEOUT_SECONDS: u64 = 12 * 60 * 60;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a queue message could not be turned into a `GradingJob`.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("job message is not valid: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("job message field '{field}' {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// The message body as sent by the web tier. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobMessage {
    job_id: String,
    image: String,
    entrypoint: String,
    s3_bucket: String,
    s3_root_key: String,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    enable_networking: Option<bool>,
    #[serde(default)]
    environment: Option<BTreeMap<String, Option<String>>>,
}

// ---------------------------------------------------------------------------
// GradingJob
// ---------------------------------------------------------------------------

/// A validated grading job. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingJob {
    pub job_id: String,
    pub image: String,
    pub entrypoint: String,
    pub s3_bucket: String,
    pub s3_root_key: String,
    /// Effective timeout in seconds; the message value or the default.
    pub timeout: u64,
    pub enable_networking: bool,
    pub environment: BTreeMap<String, Option<String>>,
}

impl GradingJob {
    /// Parse and validate a message body.
    ///
    /// Fractional timeouts round up to whole seconds.
    pub fn parse(body: &str, default_timeout: u64) -> Result<Self, MessageError> {
        let message: JobMessage = serde_json::from_str(body)?;

        for (field, value) in [
            ("jobId", &message.job_id),
            ("image", &message.image),
            ("entrypoint", &message.entrypoint),
            ("s3Bucket", &message.s3_bucket),
        ] {
            if value.trim().is_empty() {
                return Err(MessageError::Invalid {
                    field,
                    reason: "must not be empty",
                });
            }
        }

        let timeout = match message.timeout {
            None => default_timeout,
            Some(t) if t.is_finite() && t > 0.0 && t <= MAX_TIMEOUT_SECONDS as f64 => {
                t.ceil() as u64
            }
            Some(_) => {
                return Err(MessageError::Invalid {
                    field: "timeout",
                    reason: "must be a positive number of seconds, at most 12 hours",
                })
            }
        };

        Ok(Self {
            job_id: message.job_id,
            image: message.image,
            entrypoint: message.entrypoint,
            s3_bucket: message.s3_bucket,
            s3_root_key: message.s3_root_key,
            timeout,
            enable_networking: message.enable_networking.unwrap_or(false),
            environment: message.environment.unwrap_or_default(),
        })
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn hard_timeout(&self) -> Duration {
        self.soft_timeout() * HARD_TIMEOUT_MULTIPLIER
    }

    /// Key of `name` under the job's root key.
    pub fn blob_key(&self, name: &str) -> String {
        let root = self.s3_root_key.trim_end_matches('/');
        if root.is_empty() {
            name.to_string()
        } else {
            format!("{root}/{name}")
        }
    }

    /// `KEY=value`, or a bare `KEY` for null values (passes the host's value through).
    pub fn container_environment(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}={value}"),
                None => key.clone(),
            })
            .collect()
    }

    /// Entrypoint split on spaces.
    pub fn entrypoint_args(&self) -> Vec<String> {
        self.entrypoint
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The entrypoint's executable relative to the job directory, when it
    /// lives under the container mount point.
    pub fn entrypoint_relative_path(&self) -> Option<PathBuf> {
        let executable = self.entrypoint_args().into_iter().next()?;
        let relative = executable
            .strip_prefix(CONTAINER_DIRECTORY)?
            .strip_prefix('/')?;
        if relative.is_empty() || relative.split('/').any(|part| part == "..") {
            return None;
        }
        Some(PathBuf::from(relative))
    }
}
