// In-flight job counter and time-weighted load accumulator.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Average concurrency over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub average_jobs: f64,
    pub max_jobs: usize,
    pub interval: Duration,
}

#[derive(Debug)]
struct LoadInner {
    current_jobs: usize,
    /// Integral of `current_jobs` over time, in job-seconds.
    accumulated: f64,
    last_change: Instant,
    interval_start: Instant,
}

impl LoadInner {
    fn integrate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_change).as_secs_f64();
        self.accumulated += elapsed * self.current_jobs as f64;
        self.last_change = now;
    }
}

/// Counts jobs in flight and integrates `elapsed × current_jobs` on every
/// change, so `take_sample` can report average concurrency.
///
/// Always maintained, since draining waits on `current_jobs`.
#[derive(Debug)]
pub struct LoadTracker {
    max_jobs: usize,
    inner: Mutex<LoadInner>,
}

impl LoadTracker {
    pub fn new(max_jobs: usize) -> Self {
        let now = Instant::now();
        Self {
            max_jobs,
            inner: Mutex::new(LoadInner {
                current_jobs: 0,
                accumulated: 0.0,
                last_change: now,
                interval_start: now,
            }),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn current_jobs(&self) -> usize {
        self.inner.lock().current_jobs
    }

    /// Count a job as started until the returned slot is dropped.
    pub fn start_job(self: &Arc<Self>) -> JobSlot {
        let mut inner = self.inner.lock();
        inner.integrate(Instant::now());
        inner.current_jobs += 1;
        JobSlot {
            tracker: self.clone(),
        }
    }

    fn end_job(&self) {
        let mut inner = self.inner.lock();
        inner.integrate(Instant::now());
        inner.current_jobs = inner.current_jobs.saturating_sub(1);
    }

    /// Average concurrency since the previous sample; resets the interval.
    pub fn take_sample(&self) -> LoadSample {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.integrate(now);
        let interval = now.saturating_duration_since(inner.interval_start);
        let average_jobs = if interval.is_zero() {
            inner.current_jobs as f64
        } else {
            inner.accumulated / interval.as_secs_f64()
        };
        inner.accumulated = 0.0;
        inner.interval_start = now;
        LoadSample {
            average_jobs,
            max_jobs: self.max_jobs,
            interval,
        }
    }
}

/// A started job. Dropping it ends the job exactly once, on every exit path.
#[derive(Debug)]
pub struct JobSlot {
    tracker: Arc<LoadTracker>,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.tracker.end_job();
    }
}
