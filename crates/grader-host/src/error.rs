// Failures at the executor boundary. The Display strings are what the
// student sees in the job result.

/// Why a grading run did not produce results.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job timeout of {seconds}s exceeded.")]
    HardTimeout { seconds: u64 },

    /// A container runtime call failed; carries the underlying description.
    #[error("{0:#}")]
    Runtime(anyhow::Error),

    #[error("The grading results were larger than 1MB. If the problem persists, please contact course staff or a proctor.")]
    ResultsTooLarge { size: u64 },

    #[error("Could not read grading results.")]
    ResultsUnreadable(#[source] std::io::Error),

    #[error("Could not parse the grading results.")]
    ResultsUnparseable(#[source] serde_json::Error),
}

impl JobError {
    pub fn runtime(err: anyhow::Error) -> Self {
        JobError::Runtime(err)
    }
}

/// Message for a job that ran past its own timeout.
pub fn timeout_message(seconds: u64) -> String {
    format!(
        "Your grading job did not complete within the time limit of {seconds} seconds.\nPlease fix your code before submitting again."
    )
}
