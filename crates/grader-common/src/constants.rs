// Well-known names, limits and exit codes shared by the grader crates.

use std::time::Duration;

/// Process exit codes.
pub mod return_code {
    /// Drained after a termination signal.
    pub const SUCCESS: i32 = 0;
    /// Startup failed or every worker loop stopped because the host is unhealthy.
    pub const TERMINATED_ERROR: i32 = 1;
}

/// Layout of a job inside its container and working directory.
pub mod grading {
    /// Mount point of the job directory inside the container.
    pub const CONTAINER_DIRECTORY: &str = "/grade";
    /// Results file, relative to the job directory.
    pub const RESULTS_FILE: &str = "results/results.json";
    /// Largest results file that is read back.
    pub const MAX_RESULTS_BYTES: u64 = 1024 * 1024;
    /// Largest serialized result embedded in a response-queue event.
    pub const MAX_EVENT_DATA_BYTES: usize = 250 * 1024;
    /// Hard timeout as a multiple of the job's own timeout.
    pub const HARD_TIMEOUT_MULTIPLIER: u32 = 2;
    /// Tag used when an image reference has none.
    pub const DEFAULT_IMAGE_TAG: &str = "latest";
    /// Prefix for container output lines in the job log.
    pub const CONTAINER_LOG_PREFIX: &str = "container> ";
}

/// Object names under a job's root key.
pub mod blob_keys {
    pub const JOB_ARCHIVE: &str = "job.tar.gz";
    pub const RESULTS: &str = "results.json";
    pub const ARCHIVE: &str = "archive.tar.gz";
    pub const OUTPUT_LOG: &str = "output.log";
}

/// Response-queue event names.
pub mod events {
    pub const JOB_RECEIVED: &str = "job_received";
    pub const GRADING_RESULT: &str = "grading_result";
}

/// Reasons recorded when the host gives up on itself.
pub mod unhealthy {
    pub const HARD_TIMEOUT: &str = "Job timeout exceeded; Docker presumed dead.";
    pub const DOCKER_PING_FAILED: &str = "Docker ping failed";
}

/// Queue receive settings.
pub mod queue {
    /// Long-poll duration of one receive call.
    pub const RECEIVE_WAIT_SECONDS: i32 = 20;
}

/// Interval at which the drain loop re-checks the in-flight job count.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause before exiting with an error so buffered logs can flush.
pub const EXIT_DELAY: Duration = Duration::from_secs(1);

/// Environment variable naming the configuration file.
pub const CONFIG_FILE_VARIABLE: &str = "GRADER_HOST_CONFIG";

/// Prefix of environment overrides for individual configuration keys.
pub const CONFIG_ENV_PREFIX: &str = "GRADER_";
