// Jobs queue polling and response queue events over SQS.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use grader_common::constants::queue::RECEIVE_WAIT_SECONDS;
use grader_common::Tracing;
use grader_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error_throttler::ErrorThrottler;
use crate::job_message::GradingJob;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// A raw message as delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub body: Option<String>,
    pub receipt_handle: String,
}

/// A validated job together with the handle that acknowledges it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub job: GradingJob,
    pub receipt_handle: String,
}

/// Source of grading jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Long-poll for at most one message, waiting up to `wait`.
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>>;

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()>;

    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// Destination of `job_received` / `grading_result` events.
#[async_trait]
pub trait ResultsQueue: Send + Sync {
    async fn send(&self, body: String) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQS
// ---------------------------------------------------------------------------

/// A queue URL, given directly or looked up by name.
async fn resolve_queue_url(
    client: &Client,
    name: Option<&str>,
    url: Option<&str>,
) -> Result<String> {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        return Ok(url.to_string());
    }
    let name = name
        .filter(|n| !n.trim().is_empty())
        .context("Neither a queue name nor a queue URL was configured")?;
    let output = client
        .get_queue_url()
        .queue_name(name)
        .send()
        .await
        .with_context(|| format!("Failed to get URL of queue {name}"))?;
    output
        .queue_url()
        .map(str::to_string)
        .with_context(|| format!("Queue {name} has no URL"))
}

/// The jobs queue. Its URL is resolved once, at construction.
pub struct SqsJobQueue {
    client: Client,
    queue_url: String,
}

impl SqsJobQueue {
    pub async fn connect(client: Client, name: Option<&str>, url: Option<&str>) -> Result<Self> {
        let queue_url = resolve_queue_url(&client, name, url).await?;
        tracing::info!("Jobs queue URL = {queue_url}");
        Ok(Self { client, queue_url })
    }
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs().min(RECEIVE_WAIT_SECONDS as u64) as i32)
            .send()
            .await
            .context("Failed to receive from the jobs queue")?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };
        let receipt_handle = message
            .receipt_handle()
            .context("Received a message without a receipt handle")?
            .to_string();
        Ok(Some(ReceivedMessage {
            body: message.body().map(str::to_string),
            receipt_handle,
        }))
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX))
            .send()
            .await
            .context("Failed to change message visibility")?;
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete message from the jobs queue")?;
        Ok(())
    }
}

/// The response queue.
pub struct SqsResultsQueue {
    client: Client,
    queue_url: String,
}

impl SqsResultsQueue {
    pub async fn connect(client: Client, name: Option<&str>, url: Option<&str>) -> Result<Self> {
        let queue_url = resolve_queue_url(&client, name, url).await?;
        tracing::info!("Results queue URL = {queue_url}");
        Ok(Self { client, queue_url })
    }
}

#[async_trait]
impl ResultsQueue for SqsResultsQueue {
    async fn send(&self, body: String) -> Result<()> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .context("Failed to send to the results queue")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueuePoller
// ---------------------------------------------------------------------------

/// Receives one valid job at a time for a worker loop.
pub struct QueuePoller {
    queue: Arc<dyn JobQueue>,
    trace: Tracing,
    default_timeout: u64,
    visibility_margin: Duration,
    throttler: ErrorThrottler,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        trace: Tracing,
        default_timeout: u64,
        visibility_margin: Duration,
    ) -> Self {
        Self {
            queue,
            trace,
            default_timeout,
            visibility_margin,
            throttler: ErrorThrottler::new(),
        }
    }

    /// Wait for the next job.
    ///
    /// Returns `Ok(None)` once `cancel` fires; a message that arrived after
    /// that is released back to the queue. A message that fails validation
    /// is an error and stays on the queue for its redelivery policy.
    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<Option<QueueMessage>> {
        let wait = Duration::from_secs(RECEIVE_WAIT_SECONDS as u64);
        loop {
            let received = tokio::select! {
                result = self.queue.receive(wait) => result,
                _ = cancel.cancelled() => return Ok(None),
            };

            let message = match received {
                Ok(Some(message)) => {
                    self.throttler.reset();
                    message
                }
                Ok(None) => {
                    self.throttler.reset();
                    continue;
                }
                Err(e) => {
                    self.trace.error_chain("Error receiving from the jobs queue", &e);
                    if !self.throttler.increment_and_wait(cancel).await {
                        return Ok(None);
                    }
                    continue;
                }
            };

            if cancel.is_cancelled() {
                self.release(&message.receipt_handle).await;
                return Ok(None);
            }

            let Some(body) = message.body.as_deref().filter(|b| !b.is_empty()) else {
                self.trace.verbose("Skipping message without a body");
                continue;
            };

            let job = GradingJob::parse(body, self.default_timeout)
                .context("Received an invalid job message")?;

            // The container may run until the hard timeout; the margin covers
            // the image pull and the uploads around it.
            let visibility = job.hard_timeout() + self.visibility_margin;
            self.queue
                .change_visibility(&message.receipt_handle, visibility)
                .await
                .with_context(|| format!("Failed to extend visibility of job {}", job.job_id))?;

            self.trace.info(&format!(
                "Received job {} (image {}, timeout {}s)",
                job.job_id, job.image, job.timeout
            ));
            return Ok(Some(QueueMessage {
                job,
                receipt_handle: message.receipt_handle,
            }));
        }
    }

    /// The job is done; remove its message.
    pub async fn ack(&self, message: &QueueMessage) -> Result<()> {
        self.queue.delete(&message.receipt_handle).await
    }

    /// Make a message visible again right away. Failures only delay redelivery.
    pub async fn release(&self, receipt_handle: &str) {
        if let Err(e) = self
            .queue
            .change_visibility(receipt_handle, Duration::ZERO)
            .await
        {
            self.trace.error_chain("Failed to release message", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeQueue;
    use grader_common::SecretMasker;

    const VALID: &str = r#"{"jobId":"12","image":"alpine","entrypoint":"/grade/run","s3Bucket":"b","s3RootKey":"jobs/12"}"#;

    fn poller(queue: Arc<FakeQueue>) -> QueuePoller {
        QueuePoller::new(
            queue,
            Tracing::new("QueuePoller", Arc::new(SecretMasker::new())),
            30,
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn skips_empty_bodies_and_extends_visibility() {
        let queue = Arc::new(FakeQueue::new());
        queue.push(None);
        queue.push(Some(VALID));
        let mut poller = poller(queue.clone());

        let message = poller
            .poll(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.job.job_id, "12");
        assert_eq!(
            queue.visibility_changes(),
            vec![(message.receipt_handle.clone(), Duration::from_secs(70))]
        );

        poller.ack(&message).await.unwrap();
        assert_eq!(queue.deleted(), vec![message.receipt_handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn declared_timeout_sets_visibility() {
        let queue = Arc::new(FakeQueue::new());
        queue.push(Some(
            r#"{"jobId":"1","image":"a","entrypoint":"/grade/run","s3Bucket":"b","s3RootKey":"k","timeout":120}"#,
        ));
        let message = poller(queue.clone())
            .poll(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            queue.visibility_changes(),
            vec![(message.receipt_handle, Duration::from_secs(250))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_message_is_an_error_and_stays_queued() {
        let queue = Arc::new(FakeQueue::new());
        queue.push(Some(r#"{"jobId":"12"}"#));
        let err = poller(queue.clone())
            .poll(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid job message"));
        assert!(queue.deleted().is_empty());
        assert!(queue.visibility_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_the_long_poll() {
        let queue = Arc::new(FakeQueue::new());
        let cancel = CancellationToken::new();
        let mut poller = poller(queue);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { poller.poll(&cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_back_off_and_recover() {
        let queue = Arc::new(FakeQueue::new());
        queue.fail_next_receives(2);
        queue.push(Some(VALID));
        let started = tokio::time::Instant::now();
        let message = poller(queue)
            .poll(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.job.job_id, "12");
        // 1s then 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
