// Periodic average-concurrency reports to the bookkeeping store.

use grader_common::{LoadTracker, Tracing};
use grader_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bookkeeping::{LoadReport, LoadStore};

pub struct LoadReporter {
    tracker: Arc<LoadTracker>,
    store: Arc<dyn LoadStore>,
    instance_id: String,
    queue_name: String,
    interval: Duration,
    trace: Tracing,
}

impl LoadReporter {
    pub fn new(
        tracker: Arc<LoadTracker>,
        store: Arc<dyn LoadStore>,
        instance_id: String,
        queue_name: String,
        interval: Duration,
        trace: Tracing,
    ) -> Self {
        Self {
            tracker,
            store,
            instance_id,
            queue_name,
            interval,
            trace,
        }
    }

    /// Report once per interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start the interval there.
        ticker.tick().await;
        self.tracker.take_sample();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            self.report_once().await;
        }
    }

    async fn report_once(&self) {
        let sample = self.tracker.take_sample();
        let report = LoadReport {
            instance_id: self.instance_id.clone(),
            queue_name: self.queue_name.clone(),
            average_jobs: sample.average_jobs,
            max_jobs: sample.max_jobs,
        };
        self.trace.verbose(&format!(
            "Average load over {:.1}s: {:.2} of {} jobs",
            sample.interval.as_secs_f64(),
            report.average_jobs,
            report.max_jobs
        ));
        if let Err(e) = self.store.record_load(&report).await {
            self.trace.error_chain("Failed to report load", &e);
        }
    }
}
