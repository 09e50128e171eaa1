// JobExecutor: runs one grading job in a container under the dual timeout
// and turns every outcome into `GradingResults`.

use chrono::{DateTime, Utc};
use grader_common::constants::grading::{MAX_RESULTS_BYTES, RESULTS_FILE};
use grader_common::constants::unhealthy::HARD_TIMEOUT;
use grader_common::{HealthState, JobLogger, ResourceLimits};
use grader_sdk::TraceWriter;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bookkeeping::TimeReporter;
use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::error::{timeout_message, JobError};
use crate::job_message::GradingJob;
use crate::results::{sanitize, GradingResults};

/// How long log forwarding may lag behind a stopped container.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Log forwarding
// ---------------------------------------------------------------------------

/// Background task copying container output into the job log.
///
/// Dropping it stops the task, so no exit path leaves a `docker logs`
/// process behind.
struct LogForwarder {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LogForwarder {
    fn spawn(runtime: Arc<dyn ContainerRuntime>, id: &str, logger: Arc<JobLogger>) -> Self {
        let cancel = CancellationToken::new();
        let id = id.to_string();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = runtime.follow_logs(&id, logger.clone(), cancel).await {
                    logger.warning(&format!("Container log forwarding stopped: {e:#}"));
                }
            }
        });
        Self { handle, cancel }
    }

    /// Let buffered output drain once the container has stopped.
    async fn finish(mut self) {
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut self.handle)
            .await
            .is_err()
        {
            tracing::debug!("Container log forwarding did not finish in time");
        }
    }
}

impl Drop for LogForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Timing {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct ContainerExit {
    timed_out: bool,
    exit_code: i64,
}

/// Single-shot execution of prepared jobs. Shared by all worker loops.
pub struct JobExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    time_reporter: Arc<dyn TimeReporter>,
    health: Arc<HealthState>,
    limits: ResourceLimits,
}

impl JobExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        time_reporter: Arc<dyn TimeReporter>,
        health: Arc<HealthState>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            runtime,
            time_reporter,
            health,
            limits,
        }
    }

    /// Run `job` from the files in `job_dir` using `run_image`.
    ///
    /// Never fails: runtime errors, timeouts and bad output all become a
    /// failed result with a message for the student. The hard timeout
    /// (twice the job timeout) also marks the host unhealthy; after it
    /// fires the runtime is not contacted again, not even to remove the
    /// container.
    pub async fn execute(
        &self,
        job: &GradingJob,
        run_image: &str,
        job_dir: &Path,
        received_time: DateTime<Utc>,
        logger: &Arc<JobLogger>,
    ) -> GradingResults {
        let mut results = GradingResults::new(job.job_id.clone(), received_time);
        let spec = ContainerSpec::for_job(job, run_image, job_dir, self.limits);
        logger.info("Launching Docker container to run grading job");
        logger.info(&format!("Run image: {run_image}"));

        let hard_timeout = job.hard_timeout();
        let mut timing = Timing::default();
        let outcome = tokio::select! {
            outcome = self.run_container(job, &spec, logger, &mut timing) => outcome,
            _ = tokio::time::sleep(hard_timeout) => {
                self.health.flag_unhealthy(HARD_TIMEOUT);
                Err(JobError::HardTimeout { seconds: hard_timeout.as_secs() })
            }
        };
        results.start_time = timing.start_time;
        results.end_time = timing.end_time;

        let exit = match outcome {
            Ok(exit) => exit,
            Err(e) => {
                logger.error(&format!("runJob error: {e}"));
                results.message = Some(e.to_string());
                return results;
            }
        };

        results.timed_out = exit.timed_out;
        if exit.timed_out {
            logger.info("Container timed out");
            results.message = Some(timeout_message(job.timeout));
            return results;
        }

        logger.info(&format!("Container exited with exit code {}", exit.exit_code));
        if exit.exit_code != 0 {
            if let Some(size) = oversized_results(job_dir).await {
                results.message = Some(JobError::ResultsTooLarge { size }.to_string());
            }
            return results;
        }

        logger.info("Reading course results");
        match read_results(job_dir).await {
            Ok(value) => {
                results.succeeded = true;
                results.results = Some(value);
            }
            Err(e) => {
                logger.error(&format!("Could not use results.json: {e:?}"));
                results.message = Some(e.to_string());
            }
        }
        results
    }

    /// Create, run and always remove the container.
    async fn run_container(
        &self,
        job: &GradingJob,
        spec: &ContainerSpec,
        logger: &Arc<JobLogger>,
        timing: &mut Timing,
    ) -> Result<ContainerExit, JobError> {
        let id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(JobError::runtime)?;
        logger.info(&format!("Created container {} ({id})", spec.name));

        let outcome = self.start_and_wait(job, &id, logger, timing).await;

        if let Err(e) = self.runtime.remove_container(&id).await {
            logger.error(&format!("Error removing container {id}: {e:#}"));
        }
        outcome
    }

    async fn start_and_wait(
        &self,
        job: &GradingJob,
        id: &str,
        logger: &Arc<JobLogger>,
        timing: &mut Timing,
    ) -> Result<ContainerExit, JobError> {
        self.runtime
            .start_container(id)
            .await
            .map_err(JobError::runtime)?;
        logger.info("Container started!");
        let logs = LogForwarder::spawn(self.runtime.clone(), id, logger.clone());

        timing.start_time = Some(
            self.time_reporter
                .report_start_time(&job.job_id)
                .await
                .map_err(JobError::runtime)?,
        );

        logger.info("Waiting for container to complete");
        let mut timed_out = false;
        let wait = self.runtime.wait_container(id);
        tokio::pin!(wait);
        tokio::select! {
            status = &mut wait => {
                status.map_err(JobError::runtime)?;
            }
            _ = tokio::time::sleep(job.soft_timeout()) => {
                timed_out = true;
                logger.info(&format!("Job exceeded its {}s timeout, killing container", job.timeout));
                if let Err(e) = self.runtime.kill_container(id).await {
                    logger.error(&format!("Error killing container: {e:#}"));
                }
                (&mut wait).await.map_err(JobError::runtime)?;
            }
        }

        timing.end_time = Some(
            self.time_reporter
                .report_end_time(&job.job_id)
                .await
                .map_err(JobError::runtime)?,
        );

        let exit_code = self
            .runtime
            .inspect_exit_code(id)
            .await
            .map_err(JobError::runtime)?;
        logs.finish().await;

        Ok(ContainerExit {
            timed_out,
            exit_code,
        })
    }
}

/// Locate `results/results.json` without trusting anything the container
/// left behind: the file must be a regular file (not a link) whose real path
/// stays inside `job_dir`. Returns the real path and the size.
async fn locate_results(job_dir: &Path) -> std::io::Result<(PathBuf, u64)> {
    let path = job_dir.join(RESULTS_FILE);
    let metadata = tokio::fs::symlink_metadata(&path).await?;
    if !metadata.file_type().is_file() {
        return Err(std::io::Error::other(format!(
            "{RESULTS_FILE} is not a regular file"
        )));
    }
    let root = tokio::fs::canonicalize(job_dir).await?;
    let real = tokio::fs::canonicalize(&path).await?;
    if !real.starts_with(&root) {
        return Err(std::io::Error::other(format!(
            "{RESULTS_FILE} resolves outside the job directory"
        )));
    }
    Ok((real, metadata.len()))
}

/// Size of `results.json` when it exceeds the cap.
async fn oversized_results(job_dir: &Path) -> Option<u64> {
    let (_, size) = locate_results(job_dir).await.ok()?;
    (size > MAX_RESULTS_BYTES).then_some(size)
}

/// Read, size-check, parse and sanitize `results/results.json`.
async fn read_results(job_dir: &Path) -> Result<Value, JobError> {
    let (path, size) = locate_results(job_dir)
        .await
        .map_err(JobError::ResultsUnreadable)?;
    if size > MAX_RESULTS_BYTES {
        return Err(JobError::ResultsTooLarge { size });
    }
    let data = tokio::fs::read(&path)
        .await
        .map_err(JobError::ResultsUnreadable)?;
    let value: Value = serde_json::from_slice(&data).map_err(JobError::ResultsUnparseable)?;
    Ok(sanitize(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeping::LocalBookkeeping;
    use crate::testing::{ContainerBehavior, FakeRuntime};
    use grader_common::{GraderConfig, SecretMasker};
    use serde_json::json;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        health: Arc<HealthState>,
        executor: JobExecutor,
        dir: tempfile::TempDir,
        logger: Arc<JobLogger>,
    }

    fn harness(behavior: ContainerBehavior) -> Harness {
        let runtime = Arc::new(FakeRuntime::new(behavior));
        let health = Arc::new(HealthState::new());
        let executor = JobExecutor::new(
            runtime.clone(),
            Arc::new(LocalBookkeeping),
            health.clone(),
            GraderConfig::default().resource_limits(),
        );
        Harness {
            runtime,
            health,
            executor,
            dir: tempfile::tempdir().unwrap(),
            logger: Arc::new(JobLogger::new("5", Arc::new(SecretMasker::new()))),
        }
    }

    fn job(timeout: u64) -> GradingJob {
        let body = format!(
            r#"{{"jobId":"5","image":"alpine","entrypoint":"/grade/run.sh","s3Bucket":"b","s3RootKey":"k","timeout":{timeout}}}"#
        );
        GradingJob::parse(&body, 30).unwrap()
    }

    impl Harness {
        async fn run(&self, job: &GradingJob) -> GradingResults {
            self.executor
                .execute(job, "alpine:latest", self.dir.path(), Utc::now(), &self.logger)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_returns_parsed_results() {
        let h = harness(ContainerBehavior::exit(0, br#"{"score":1,"feedback":"ok\u0000"}"#));
        let results = h.run(&job(30)).await;

        assert!(results.succeeded);
        assert!(!results.timed_out);
        assert_eq!(results.results, Some(json!({"score": 1, "feedback": "ok"})));
        assert!(results.message.is_none());
        assert!(results.start_time.is_some() && results.end_time.is_some());
        assert_eq!(h.runtime.removed(), vec!["c1".to_string()]);
        assert!(h.logger.contents().contains("container> hello from c1"));
        assert!(h.health.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_kills_and_removes_the_container() {
        let h = harness(ContainerBehavior::RunUntilKilled);
        let results = h.run(&job(5)).await;

        assert!(results.timed_out);
        assert!(!results.succeeded);
        assert!(results.results.is_none());
        assert!(results
            .message
            .unwrap()
            .contains("did not complete within the time limit of 5 seconds"));
        assert_eq!(h.runtime.killed(), vec!["c1".to_string()]);
        assert_eq!(h.runtime.removed(), vec!["c1".to_string()]);
        assert!(h.health.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_marks_host_unhealthy_without_cleanup() {
        let h = harness(ContainerBehavior::Unresponsive);
        let started = tokio::time::Instant::now();
        let results = h.run(&job(5)).await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!results.succeeded);
        assert_eq!(results.message.as_deref(), Some("Job timeout of 10s exceeded."));
        assert!(!h.health.is_healthy());
        assert_eq!(h.health.reason(), Some(HARD_TIMEOUT));
        assert!(h.runtime.removed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_results_fail_regardless_of_exit_code() {
        let big = vec![b' '; (MAX_RESULTS_BYTES + 1) as usize];
        for code in [0, 1] {
            let h = harness(ContainerBehavior::exit(code, &big));
            let results = h.run(&job(30)).await;
            assert!(!results.succeeded);
            assert!(results.results.is_none());
            assert!(results.message.unwrap().contains("larger than 1MB"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_is_a_parse_failure() {
        let h = harness(ContainerBehavior::exit(0, b"{not json"));
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert_eq!(
            results.message.as_deref(),
            Some("Could not parse the grading results.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_results_are_unreadable() {
        let h = harness(ContainerBehavior::Exit {
            code: 0,
            run_time: Duration::from_secs(1),
            results: None,
        });
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert_eq!(
            results.message.as_deref(),
            Some("Could not read grading results.")
        );
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn linked_results_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("results.json"), br#"{"aws_secret":"hunter2"}"#)
            .unwrap();

        // results.json itself is a link.
        let h = harness(ContainerBehavior::Exit {
            code: 0,
            run_time: Duration::from_secs(1),
            results: None,
        });
        std::fs::create_dir(h.dir.path().join("results")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("results.json"),
            h.dir.path().join(RESULTS_FILE),
        )
        .unwrap();
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert!(results.results.is_none());
        assert_eq!(
            results.message.as_deref(),
            Some("Could not read grading results.")
        );

        // The results directory is a link.
        let h = harness(ContainerBehavior::Exit {
            code: 0,
            run_time: Duration::from_secs(1),
            results: None,
        });
        std::os::unix::fs::symlink(outside.path(), h.dir.path().join("results")).unwrap();
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert!(results.results.is_none());
        assert_eq!(
            results.message.as_deref(),
            Some("Could not read grading results.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_fails_without_results() {
        let h = harness(ContainerBehavior::exit(2, br#"{"score":0}"#));
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert!(!results.timed_out);
        assert!(results.results.is_none());
        assert!(results.message.is_none());
        assert_eq!(h.runtime.removed(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_errors_become_messages() {
        let h = harness(ContainerBehavior::exit(0, b"{}"));
        h.runtime.fail_create(true);
        let results = h.run(&job(30)).await;
        assert!(!results.succeeded);
        assert!(results.message.unwrap().contains("daemon unavailable"));
        assert!(h.runtime.removed().is_empty());
        assert!(h.health.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn container_gets_job_parameters() {
        let h = harness(ContainerBehavior::exit(0, b"{}"));
        h.run(&job(30)).await;
        let specs = h.runtime.created();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].image, "alpine:latest");
        assert!(specs[0].network_disabled);
        assert_eq!(specs[0].limits.memory, specs[0].limits.memory_swap);
        assert_eq!(
            specs[0].volumes,
            vec![format!("{}:/grade", h.dir.path().display())]
        );
    }
}
