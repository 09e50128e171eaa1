use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error(
    "Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'."
)]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Everything a finished process printed, for short-lived commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    /// Trimmed stderr joined into one line, for error messages.
    pub fn stderr_text(&self) -> String {
        self.stderr
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns a child process with an argument vector, reads stdout/stderr on
/// separate tasks, and delivers output lines through channels.
///
/// Cancellation sends SIGTERM and escalates to SIGKILL. The child is also
/// killed if the future driving `execute` is dropped, so callers may wrap an
/// invocation in a timeout without leaking processes.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    stdout_tx: mpsc::UnboundedSender<String>,
    stdout_rx: Option<mpsc::UnboundedReceiver<String>>,
    stderr_tx: mpsc::UnboundedSender<String>,
    stderr_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Take the stdout receiver. Can only be called once; subsequent calls return `None`.
    ///
    /// The channel closes once the process has exited and `execute` returned.
    pub fn take_stdout_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stdout_rx.take()
    }

    /// Take the stderr receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_stderr_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr_rx.take()
    }

    /// Run `file_name` with `arguments` and return its exit code.
    ///
    /// Consumes the invoker so the output channels close when the process is done.
    pub async fn execute<S: AsRef<OsStr>>(
        self,
        file_name: S,
        arguments: &[String],
        require_exit_code_zero: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        let file_name = file_name.as_ref();
        let display_name = file_name.to_string_lossy().to_string();
        let display_args = arguments.join(" ");
        self.trace
            .verbose(&format!("Starting process: '{display_name}' {display_args}"));

        let mut cmd = Command::new(file_name);
        cmd.args(arguments)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to start process '{display_name}' with arguments '{display_args}'")
        })?;
        let pid = child.id().unwrap_or(0);

        let stdout_task = spawn_line_reader(child.stdout.take(), self.stdout_tx.clone());
        let stderr_task = spawn_line_reader(child.stderr.take(), self.stderr_tx.clone());

        let exit_code: i32;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                exit_code = status
                    .context("Failed to wait for process")?
                    .code()
                    .unwrap_or(-1);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.verbose(&format!("Cancellation requested for process {pid}."));
                exit_code = self.cancel_and_kill_process(&mut child).await;
            }
        }

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        self.trace.verbose(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            anyhow::bail!("Process '{display_name}' was cancelled");
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: display_name,
                arguments: display_args,
            }
            .into());
        }

        Ok(exit_code)
    }

    /// Run a short-lived command to completion and collect all of its output.
    pub async fn run_collecting<S: AsRef<OsStr>>(
        trace: Arc<dyn TraceWriter>,
        file_name: S,
        arguments: &[String],
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutput> {
        let mut invoker = ProcessInvoker::new(trace);
        let mut stdout_rx = invoker.take_stdout_receiver().context("stdout receiver taken")?;
        let mut stderr_rx = invoker.take_stderr_receiver().context("stderr receiver taken")?;

        let collect_stdout = async {
            let mut lines = Vec::new();
            while let Some(line) = stdout_rx.recv().await {
                lines.push(line);
            }
            lines
        };
        let collect_stderr = async {
            let mut lines = Vec::new();
            while let Some(line) = stderr_rx.recv().await {
                lines.push(line);
            }
            lines
        };

        let (exit_code, stdout, stderr) = tokio::join!(
            invoker.execute(file_name, arguments, false, cancellation_token),
            collect_stdout,
            collect_stderr
        );

        Ok(ProcessOutput {
            exit_code: exit_code?,
            stdout,
            stderr,
        })
    }

    /// SIGTERM first, SIGKILL if the process ignores it.
    async fn cancel_and_kill_process(&self, child: &mut tokio::process::Child) -> i32 {
        if self.send_sigterm_and_wait(child, SIGTERM_TIMEOUT).await {
            self.trace
                .verbose("Process terminated successfully through SIGTERM.");
        } else {
            self.trace
                .verbose("Killing process since the terminate signal was ignored.");
            let _ = child.kill().await;
        }
        child
            .wait()
            .await
            .map(|s| s.code().unwrap_or(-1))
            .unwrap_or(-1)
    }

    /// Returns `true` if the process exited within `timeout`.
    #[cfg(unix)]
    async fn send_sigterm_and_wait(
        &self,
        child: &mut tokio::process::Child,
        timeout: Duration,
    ) -> bool {
        let pid = match child.id() {
            Some(id) => id,
            None => return true,
        };

        let sig = nix::sys::signal::Signal::SIGTERM;
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .verbose(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.verbose(&format!(
                    "Process {pid} did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_sigterm_and_wait(
        &self,
        child: &mut tokio::process::Child,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

fn spawn_line_reader<R>(
    stream: Option<R>,
    tx: mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(stream) = stream {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line);
            }
        }
    })
}
