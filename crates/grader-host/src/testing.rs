// In-memory stand-ins for the host's external collaborators.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use grader_common::JobLogger;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::blob_store::BlobStore;
use crate::bookkeeping::{CancellationCheck, LoadReport, LoadStore};
use crate::docker::{ContainerRuntime, ContainerSpec};
use crate::lifecycle::Lifecycle;
use crate::queue::{JobQueue, ReceivedMessage, ResultsQueue};

/// A gzip tarball holding `files` (path, contents).
pub fn make_job_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A job message body for `job_id` with the given timeout.
pub fn job_body(job_id: &str, timeout: u64) -> String {
    format!(
        r#"{{"jobId":"{job_id}","image":"prairielearn/grader-python","entrypoint":"/grade/run.sh","s3Bucket":"bucket","s3RootKey":"jobs/{job_id}","timeout":{timeout}}}"#
    )
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

/// What every container created by a `FakeRuntime` does.
#[derive(Debug, Clone)]
pub enum ContainerBehavior {
    /// Exit with `code` after `run_time`, leaving `results` as results.json.
    Exit {
        code: i64,
        run_time: Duration,
        results: Option<Vec<u8>>,
    },
    /// Run until killed, then exit with 137.
    RunUntilKilled,
    /// Never return from `wait`, even when killed.
    Unresponsive,
}

impl ContainerBehavior {
    pub fn exit(code: i64, results: &[u8]) -> Self {
        ContainerBehavior::Exit {
            code,
            run_time: Duration::from_secs(1),
            results: Some(results.to_vec()),
        }
    }
}

#[derive(Default)]
struct RuntimeState {
    created: Vec<ContainerSpec>,
    mounts: HashMap<String, PathBuf>,
    kill_switches: HashMap<String, CancellationToken>,
    killed: Vec<String>,
    removed: Vec<String>,
    pulled: Vec<String>,
}

pub struct FakeRuntime {
    behavior: Mutex<ContainerBehavior>,
    state: Mutex<RuntimeState>,
    next_id: AtomicUsize,
    fail_ping: AtomicBool,
    fail_pull: AtomicBool,
    fail_create: AtomicBool,
}

impl FakeRuntime {
    pub fn new(behavior: ContainerBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            state: Mutex::new(RuntimeState::default()),
            next_id: AtomicUsize::new(0),
            fail_ping: AtomicBool::new(false),
            fail_pull: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pull(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().created.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    fn kill_switch(&self, id: &str) -> CancellationToken {
        self.state
            .lock()
            .kill_switches
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            anyhow::bail!("Cannot connect to the Docker daemon");
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.fail_pull.load(Ordering::SeqCst) {
            anyhow::bail!("manifest for {image} not found");
        }
        self.state.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("daemon unavailable");
        }
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mount = spec
            .volumes
            .first()
            .and_then(|v| v.rsplit_once(':'))
            .map(|(host, _)| PathBuf::from(host))
            .unwrap_or_default();
        let mut state = self.state.lock();
        state.created.push(spec.clone());
        state.mounts.insert(id.clone(), mount);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let behavior = self.behavior.lock().clone();
        if let ContainerBehavior::Exit {
            results: Some(results),
            ..
        } = behavior
        {
            let mount = self.state.lock().mounts.get(id).cloned().unwrap_or_default();
            let dir = mount.join("results");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("results.json"), results)?;
        }
        Ok(())
    }

    async fn follow_logs(
        &self,
        id: &str,
        logger: Arc<JobLogger>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        logger.container_line(&format!("hello from {id}"));
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let behavior = self.behavior.lock().clone();
        match behavior {
            ContainerBehavior::Exit { code, run_time, .. } => {
                let kill = self.kill_switch(id);
                tokio::select! {
                    _ = tokio::time::sleep(run_time) => Ok(code),
                    _ = kill.cancelled() => Ok(137),
                }
            }
            ContainerBehavior::RunUntilKilled => {
                self.kill_switch(id).cancelled().await;
                Ok(137)
            }
            ContainerBehavior::Unresponsive => std::future::pending().await,
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.kill_switch(id).cancel();
        self.state.lock().killed.push(id.to_string());
        Ok(())
    }

    async fn inspect_exit_code(&self, id: &str) -> Result<i64> {
        if self.state.lock().killed.iter().any(|k| k == id) {
            return Ok(137);
        }
        match &*self.behavior.lock() {
            ContainerBehavior::Exit { code, .. } => Ok(*code),
            _ => Ok(137),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.state.lock().removed.push(id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ReceivedMessage>,
    /// Receipt handles currently hidden by a receive.
    in_flight: HashSet<String>,
    deleted: Vec<String>,
    visibility_changes: Vec<(String, Duration)>,
    failures_left: usize,
    next_handle: usize,
    delete_delay: Duration,
}

/// An in-memory jobs queue. An empty receive waits briefly, not the full
/// long-poll duration.
pub struct FakeQueue {
    state: Mutex<QueueState>,
    empty_wait: Duration,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            empty_wait: Duration::from_millis(20),
        }
    }

    pub fn push(&self, body: Option<&str>) -> String {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let receipt_handle = format!("r{}", state.next_handle);
        state.pending.push_back(ReceivedMessage {
            body: body.map(str::to_string),
            receipt_handle: receipt_handle.clone(),
        });
        receipt_handle
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.state.lock().failures_left = count;
    }

    /// Make every delete take `delay` before it is recorded.
    pub fn slow_deletes(&self, delay: Duration) {
        self.state.lock().delete_delay = delay;
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn visibility_changes(&self) -> Vec<(String, Duration)> {
        self.state.lock().visibility_changes.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        {
            let mut state = self.state.lock();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                anyhow::bail!("connection reset by peer");
            }
            if let Some(message) = state.pending.pop_front() {
                state.in_flight.insert(message.receipt_handle.clone());
                return Ok(Some(message));
            }
        }
        tokio::time::sleep(wait.min(self.empty_wait)).await;
        Ok(None)
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()> {
        self.state
            .lock()
            .visibility_changes
            .push((receipt_handle.to_string(), timeout));
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let delay = self.state.lock().delete_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.in_flight.remove(receipt_handle);
        state.deleted.push(receipt_handle.to_string());
        Ok(())
    }
}

/// Records every event sent to the response queue.
pub struct RecordingResultsQueue {
    events: Mutex<Vec<Value>>,
    fail: bool,
}

impl RecordingResultsQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ResultsQueue for RecordingResultsQueue {
    async fn send(&self, body: String) -> Result<()> {
        if self.fail {
            anyhow::bail!("results queue unreachable");
        }
        self.events.lock().push(serde_json::from_str(&body)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blob storage
// ---------------------------------------------------------------------------

pub struct FakeBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl FakeBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    fn check_put(&self, bucket: &str, key: &str) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            anyhow::bail!("Access Denied for s3://{bucket}/{key}");
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn download_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let data = self
            .get(bucket, key)
            .ok_or_else(|| anyhow::anyhow!("NoSuchKey: s3://{bucket}/{key}"))?;
        std::fs::write(dest, data)?;
        Ok(())
    }

    async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<()> {
        self.check_put(bucket, key)?;
        self.insert(bucket, key, body.to_vec());
        Ok(())
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        _content_type: &str,
    ) -> Result<()> {
        self.check_put(bucket, key)?;
        self.insert(bucket, key, std::fs::read(path)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping and lifecycle
// ---------------------------------------------------------------------------

pub struct RecordingLoadStore {
    reports: Mutex<Vec<LoadReport>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingLoadStore {
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn reports(&self) -> Vec<LoadReport> {
        self.reports.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadStore for RecordingLoadStore {
    async fn record_load(&self, report: &LoadReport) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("database unavailable");
        }
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Reports the listed job ids as canceled.
pub struct CanceledJobs(pub Vec<String>);

#[async_trait]
impl CancellationCheck for CanceledJobs {
    async fn is_canceled(&self, job_id: &str) -> Result<bool> {
        Ok(self.0.iter().any(|id| id == job_id))
    }
}

/// Records lifecycle transitions.
#[derive(Default)]
pub struct RecordingLifecycle {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingLifecycle {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Lifecycle for RecordingLifecycle {
    async fn in_service(&self) -> Result<()> {
        self.calls.lock().push("in_service");
        Ok(())
    }

    async fn abandon_launch(&self) -> Result<()> {
        self.calls.lock().push("abandon_launch");
        Ok(())
    }
}
