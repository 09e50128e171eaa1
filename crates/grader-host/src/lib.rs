// grader-host: Polls the jobs queue, runs each grading job in a sandboxed
// container and publishes the results.

pub mod archive;
pub mod aws;
pub mod blob_store;
pub mod bookkeeping;
pub mod docker;
pub mod error;
pub mod error_throttler;
pub mod executor;
pub mod health_check;
pub mod host;
pub mod job_files;
pub mod job_message;
pub mod lifecycle;
pub mod load_reporter;
pub mod publisher;
pub mod queue;
pub mod results;

#[cfg(test)]
pub(crate) mod testing;
