// GraderHost: the worker loops. Each loop polls for a job, prepares it,
// executes it, publishes the outcome and only then acknowledges the message.

use anyhow::{Context, Result};
use futures::FutureExt;
use grader_common::constants::grading::DEFAULT_IMAGE_TAG;
use grader_common::{HostContext, JobLogger, Tracing};
use grader_sdk::{DockerName, TraceWriter};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::blob_store::BlobStore;
use crate::bookkeeping::{CancellationCheck, TimeReporter};
use crate::docker::ContainerRuntime;
use crate::executor::JobExecutor;
use crate::job_files;
use crate::job_message::GradingJob;
use crate::lifecycle::wait_for_drain;
use crate::publisher::ResultsPublisher;
use crate::queue::{JobQueue, QueuePoller, ResultsQueue};
use crate::results::GradingResults;

/// External collaborators of the worker loops.
#[derive(Clone)]
pub struct HostServices {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub jobs_queue: Arc<dyn JobQueue>,
    pub results_queue: Arc<dyn ResultsQueue>,
    pub blob_store: Arc<dyn BlobStore>,
    pub time_reporter: Arc<dyn TimeReporter>,
    pub cancellation: Arc<dyn CancellationCheck>,
}

/// Why the worker loops stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostExit {
    /// Termination was requested and every in-flight job finished.
    Drained,
    /// The host flagged itself unhealthy.
    Unhealthy(String),
}

/// `image` with the default tag and, when configured, the cache registry.
pub fn resolve_image(image: &str, cache_registry: Option<&str>) -> Result<String> {
    let mut name = DockerName::parse(image)
        .with_context(|| format!("Invalid image '{image}'"))?
        .with_default_tag(DEFAULT_IMAGE_TAG);
    if let Some(registry) = cache_registry.filter(|r| !r.is_empty()) {
        name = name.with_registry(registry);
    }
    Ok(name.to_string())
}

pub struct GraderHost {
    context: Arc<HostContext>,
    services: HostServices,
    executor: JobExecutor,
    publisher: ResultsPublisher,
    trace: Tracing,
}

impl GraderHost {
    pub fn new(context: Arc<HostContext>, services: HostServices) -> Arc<Self> {
        let executor = JobExecutor::new(
            services.runtime.clone(),
            services.time_reporter.clone(),
            context.health().clone(),
            context.config().resource_limits(),
        );
        let publisher =
            ResultsPublisher::new(services.blob_store.clone(), services.results_queue.clone());
        let trace = context.get_trace("GraderHost");
        Arc::new(Self {
            context,
            services,
            executor,
            publisher,
            trace,
        })
    }

    /// Pull every configured preload image. Failures are only logged.
    pub async fn preload_images(&self) {
        let config = self.context.config();
        if !config.use_image_preloading {
            return;
        }
        for image in &config.preload_images {
            if let Err(e) = self.preload_image(image).await {
                self.trace
                    .error_chain(&format!("Failed to preload image {image}"), &e);
            }
        }
    }

    async fn preload_image(&self, image: &str) -> Result<()> {
        let run_image = resolve_image(
            image,
            self.context.config().cache_image_registry.as_deref(),
        )?;
        self.trace.info(&format!("Preloading image {run_image}"));
        self.services.runtime.pull_image(&run_image).await
    }

    /// Run the worker loops until the host drains or becomes unhealthy.
    pub async fn run(self: Arc<Self>) -> HostExit {
        let max_jobs = self.context.config().max_concurrent_jobs;
        self.trace.info(&format!("Starting {max_jobs} worker loop(s)"));

        // Polling stops on termination and on unhealthiness.
        let stop_polling = self.context.shutdown_token().child_token();
        tokio::spawn({
            let health = self.context.health().clone();
            let stop_polling = stop_polling.clone();
            async move {
                tokio::select! {
                    _ = health.unhealthy() => stop_polling.cancel(),
                    _ = stop_polling.cancelled() => {}
                }
            }
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..max_jobs {
            workers.spawn(self.clone().worker_loop(worker_id, stop_polling.clone()));
        }

        let all_stopped = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    self.trace.error(&format!("Worker loop ended abnormally: {e}"));
                }
            }
        };
        tokio::pin!(all_stopped);
        // Workers are never aborted: an idle slot count does not mean every
        // loop is past its last queue call.
        tokio::select! {
            _ = &mut all_stopped => {}
            _ = wait_for_drain(&self.context) => all_stopped.await,
        }

        match self.context.health().reason() {
            Some(reason) => HostExit::Unhealthy(reason.to_string()),
            None => HostExit::Drained,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, stop_polling: CancellationToken) {
        let trace = self.context.get_trace(&format!("Worker-{worker_id}"));
        let config = self.context.config();
        let mut poller = QueuePoller::new(
            self.services.jobs_queue.clone(),
            trace.clone(),
            config.default_timeout_sec,
            config.visibility_margin(),
        );

        loop {
            if !self.context.health().is_healthy() {
                trace.info("Host is unhealthy; worker stopping");
                return;
            }
            if self.context.is_terminating() {
                trace.info("Host is terminating; worker stopping");
                return;
            }

            let iteration = AssertUnwindSafe(self.process_next(&mut poller, &trace, &stop_polling))
                .catch_unwind()
                .await;
            match iteration {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace.error_chain("Error processing job", &e),
                Err(_) => trace.error("Worker iteration panicked; returning to polling"),
            }
        }
    }

    /// One poll → execute → publish → ack cycle.
    ///
    /// The message is deleted only when every step before it succeeded;
    /// otherwise it reappears after its visibility timeout.
    pub async fn process_next(
        &self,
        poller: &mut QueuePoller,
        trace: &Tracing,
        stop_polling: &CancellationToken,
    ) -> Result<()> {
        let Some(message) = poller.poll(stop_polling).await? else {
            return Ok(());
        };
        // Held until the message is deleted, so a drain never exits between
        // publishing and acknowledging.
        let _slot = self.context.load().start_job();
        let job = &message.job;
        trace.info(&format!("Received {} from queue", job.job_id));

        if self.services.cancellation.is_canceled(&job.job_id).await? {
            trace.info(&format!("Job {} was canceled; skipping job", job.job_id));
            return poller.ack(&message).await;
        }

        self.handle_job(job)
            .await
            .with_context(|| format!("Job {} failed", job.job_id))?;
        trace.info(&format!("Job {} completed", job.job_id));
        poller.ack(&message).await
    }

    /// Prepare, execute and publish one job.
    pub async fn handle_job(&self, job: &GradingJob) -> Result<()> {
        let logger = Arc::new(JobLogger::new(
            job.job_id.clone(),
            self.context.secret_masker.clone(),
        ));
        logger.info(&format!(
            "Logging job {} to S3: {}/{}",
            job.job_id, job.s3_bucket, job.s3_root_key
        ));
        logger.info(&format!("Running job {}", job.job_id));
        logger.info_object(job);

        let received_time = self
            .services
            .time_reporter
            .report_received_time(&job.job_id)
            .await?;

        let (_, docker_init, file_init) = tokio::join!(
            self.publisher.report_received(job, received_time, &logger),
            self.init_docker(job, &logger),
            job_files::prepare(job, self.services.blob_store.as_ref(), &*logger),
        );

        let results = match (&docker_init, &file_init) {
            (Ok(run_image), Ok(job_dir)) => {
                self.executor
                    .execute(job, run_image, job_dir.path(), received_time, &logger)
                    .await
            }
            _ => {
                let mut messages = Vec::new();
                if let Err(e) = &docker_init {
                    logger.error(&format!("Error initializing Docker: {e:#}"));
                    messages.push(format!("Could not pull Docker image {}.", job.image));
                }
                if let Err(e) = &file_init {
                    logger.error(&format!("Error initializing files: {e:#}"));
                    messages.push("Could not initialize files for grading.".to_string());
                }
                GradingResults::failed_before_start(
                    job.job_id.clone(),
                    received_time,
                    messages.join("\n"),
                )
            }
        };

        logger.info(&format!("Job {} completed with results:", job.job_id));
        logger.info_object(&results);

        let job_dir = file_init.ok();
        let published = self
            .publish_all(job, &results, job_dir.as_ref().map(|d| d.path()), &logger)
            .await;

        if published.is_ok() {
            if let Some(dir) = job_dir {
                logger.info("Removing temporary directories");
                if let Err(e) = dir.close() {
                    logger.warning(&format!("Could not remove job directory: {e}"));
                }
            }
        }

        // Last, so the log captures everything above.
        let log_uploaded = self.publisher.upload_log(job, &logger).await;
        published?;
        log_uploaded
    }

    async fn init_docker(&self, job: &GradingJob, logger: &JobLogger) -> Result<String> {
        logger.info("Pinging docker");
        self.services.runtime.ping().await?;

        let run_image = resolve_image(
            &job.image,
            self.context.config().cache_image_registry.as_deref(),
        )?;
        logger.info(&format!("Pulling latest version of \"{run_image}\" image"));
        self.services
            .runtime
            .pull_image(&run_image)
            .await
            .with_context(|| format!("Failed to pull {run_image}"))?;
        Ok(run_image)
    }

    /// Results and, when the directory exists, the archive. Both are
    /// attempted; the first error is returned.
    async fn publish_all(
        &self,
        job: &GradingJob,
        results: &GradingResults,
        job_dir: Option<&Path>,
        logger: &JobLogger,
    ) -> Result<()> {
        let archive = async {
            match job_dir {
                Some(dir) => self.publisher.upload_archive(job, dir, logger).await,
                None => Ok(()),
            }
        };
        let (results_uploaded, archive_uploaded) =
            tokio::join!(self.publisher.publish(job, results, logger), archive);
        results_uploaded?;
        archive_uploaded
    }
}
