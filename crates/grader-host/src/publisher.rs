// Results publishing: results.json, response queue events, the archive and
// the job log.

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use grader_common::constants::blob_keys::{ARCHIVE, OUTPUT_LOG, RESULTS};
use grader_common::constants::events::{GRADING_RESULT, JOB_RECEIVED};
use grader_common::constants::grading::MAX_EVENT_DATA_BYTES;
use grader_common::JobLogger;
use grader_sdk::TraceWriter;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::archive::build_archive;
use crate::blob_store::BlobStore;
use crate::job_message::GradingJob;
use crate::queue::ResultsQueue;
use crate::results::GradingResults;

/// A response queue event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultsEvent<'a> {
    job_id: &'a str,
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedData {
    received_time: DateTime<Utc>,
}

/// Writes everything a finished job leaves behind.
pub struct ResultsPublisher {
    blob_store: Arc<dyn BlobStore>,
    results_queue: Arc<dyn ResultsQueue>,
}

impl ResultsPublisher {
    pub fn new(blob_store: Arc<dyn BlobStore>, results_queue: Arc<dyn ResultsQueue>) -> Self {
        Self {
            blob_store,
            results_queue,
        }
    }

    /// Tell the web tier the job was picked up. Never fails the job.
    pub async fn report_received(
        &self,
        job: &GradingJob,
        received_time: DateTime<Utc>,
        logger: &JobLogger,
    ) {
        let data = serde_json::to_value(ReceivedData { received_time }).ok();
        if let Err(e) = self.send_event(&job.job_id, JOB_RECEIVED, data).await {
            logger.error(&format!("Error sending job_received event: {e:#}"));
        }
    }

    /// Store `results.json`, then announce it on the response queue.
    ///
    /// Only the blob write can fail this call. The event embeds the results
    /// when they fit in a queue message; otherwise the web tier fetches
    /// them from storage.
    pub async fn publish(
        &self,
        job: &GradingJob,
        results: &GradingResults,
        logger: &JobLogger,
    ) -> Result<()> {
        let body = serde_json::to_string_pretty(results).context("Failed to serialize results")?;
        self.blob_store
            .put_bytes(
                &job.s3_bucket,
                &job.blob_key(RESULTS),
                Bytes::from(body.clone().into_bytes()),
                "application/json",
            )
            .await
            .context("Failed to upload results")?;
        logger.info(&format!(
            "Uploaded results to s3://{}/{}",
            job.s3_bucket,
            job.blob_key(RESULTS)
        ));

        // The event carries compact JSON, so that is what has to fit.
        let compact = serde_json::to_string(results).context("Failed to serialize results")?;
        let data = if compact.len() <= MAX_EVENT_DATA_BYTES {
            Some(serde_json::to_value(results).context("Failed to serialize results")?)
        } else {
            logger.info("Results too large to embed in the grading_result event");
            None
        };

        if let Err(e) = self.send_event(&job.job_id, GRADING_RESULT, data).await {
            logger.error(&format!("Error sending grading_result event: {e:#}"));
        }
        Ok(())
    }

    /// Upload the job directory as `archive.tar.gz`.
    ///
    /// The temporary tarball is removed on every path.
    pub async fn upload_archive(
        &self,
        job: &GradingJob,
        job_dir: &Path,
        logger: &JobLogger,
    ) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("job_archive_")
            .suffix(".tar.gz")
            .tempfile()
            .context("Failed to create temporary archive file")?;

        let src = job_dir.to_path_buf();
        let dest = temp.path().to_path_buf();
        tokio::task::spawn_blocking(move || build_archive(&src, &dest))
            .await
            .context("Archive task panicked")??;

        self.blob_store
            .put_file(
                &job.s3_bucket,
                &job.blob_key(ARCHIVE),
                temp.path(),
                "application/gzip",
            )
            .await
            .context("Failed to upload archive")?;
        logger.info(&format!(
            "Uploaded archive to s3://{}/{}",
            job.s3_bucket,
            job.blob_key(ARCHIVE)
        ));
        Ok(())
    }

    /// Upload everything logged for the job as `output.log`.
    pub async fn upload_log(&self, job: &GradingJob, logger: &JobLogger) -> Result<()> {
        self.blob_store
            .put_bytes(
                &job.s3_bucket,
                &job.blob_key(OUTPUT_LOG),
                Bytes::from(logger.contents()),
                "text/plain",
            )
            .await
            .context("Failed to upload job log")
    }

    async fn send_event(
        &self,
        job_id: &str,
        event: &'static str,
        data: Option<Value>,
    ) -> Result<()> {
        let body = serde_json::to_string(&ResultsEvent { job_id, event, data })?;
        self.results_queue.send(body).await
    }
}
