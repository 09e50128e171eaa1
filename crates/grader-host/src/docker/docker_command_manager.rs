// DockerCommandManager: the container runtime, driven through the Docker CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use grader_common::JobLogger;
use grader_sdk::{ProcessInvoker, TraceWriter, WhichUtil};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ContainerRuntime, ContainerSpec};

/// Docker CLI trace writer.
struct DockerTraceWriter;

impl TraceWriter for DockerTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(target: "docker", "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "docker", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "docker", "{}", message);
    }
}

/// Runs `docker` subcommands with argument vectors (never through a shell).
///
/// Invocations are not cancelled explicitly: a caller that stops waiting
/// (the hard timeout) drops the future, which kills the CLI process.
pub struct DockerCommandManager {
    docker_path: PathBuf,
}

impl DockerCommandManager {
    pub fn with_path(docker_path: impl Into<PathBuf>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    /// Resolve `docker_path` on PATH, failing if it does not exist.
    pub fn locate(docker_path: &str) -> Result<Self> {
        let resolved = WhichUtil::which(docker_path, true)?
            .with_context(|| format!("{docker_path} not found"))?;
        Ok(Self::with_path(resolved))
    }

    fn trace() -> Arc<dyn TraceWriter> {
        Arc::new(DockerTraceWriter)
    }

    /// Run a Docker CLI command and return its stdout.
    ///
    /// A non-zero exit becomes an error carrying the CLI's stderr, which is
    /// where the daemon's explanation ends up.
    async fn run_docker_command(&self, args: Vec<String>) -> Result<String> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let output = ProcessInvoker::run_collecting(
            Self::trace(),
            &self.docker_path,
            &args,
            CancellationToken::new(),
        )
        .await
        .with_context(|| format!("Failed to run docker {subcommand}"))?;

        if output.exit_code != 0 {
            anyhow::bail!(
                "docker {subcommand} exited with code {}: {}",
                output.exit_code,
                output.stderr_text()
            );
        }

        Ok(output.stdout.join("\n"))
    }
}

fn parse_status_code(output: &str, what: &str) -> Result<i64> {
    output
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Unexpected {what} output '{}'", output.trim()))
}

#[async_trait]
impl ContainerRuntime for DockerCommandManager {
    async fn ping(&self) -> Result<()> {
        let version = self
            .run_docker_command(vec![
                "version".into(),
                "--format".into(),
                "{{.Server.Version}}".into(),
            ])
            .await?;
        tracing::debug!(target: "docker", "Docker daemon version {}", version.trim());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.run_docker_command(vec!["pull".into(), "--quiet".into(), image.into()])
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.run_docker_command(spec.build_create_args()).await?;
        // Warnings (e.g. ignored kernel memory limits) precede the id.
        let id = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .context("docker create printed no container id")?;
        Ok(id.to_string())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run_docker_command(vec!["start".into(), id.into()])
            .await?;
        Ok(())
    }

    async fn follow_logs(
        &self,
        id: &str,
        logger: Arc<JobLogger>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut invoker = ProcessInvoker::new(Self::trace());
        let mut stdout = invoker
            .take_stdout_receiver()
            .context("stdout receiver taken")?;
        let mut stderr = invoker
            .take_stderr_receiver()
            .context("stderr receiver taken")?;

        let forward = async {
            loop {
                let line = tokio::select! {
                    Some(line) = stdout.recv() => line,
                    Some(line) = stderr.recv() => line,
                    else => break,
                };
                logger.container_line(line.trim_end_matches('\r'));
            }
        };

        let args = vec!["logs".to_string(), "--follow".to_string(), id.to_string()];
        let (result, ()) = tokio::join!(
            invoker.execute(&self.docker_path, &args, true, cancel.clone()),
            forward
        );

        match result {
            Ok(_) => Ok(()),
            Err(_) if cancel.is_cancelled() => Ok(()),
            Err(e) => Err(e).context("Failed to follow container logs"),
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let output = self
            .run_docker_command(vec!["wait".into(), id.into()])
            .await?;
        parse_status_code(&output, "docker wait")
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.run_docker_command(vec!["kill".into(), id.into()])
            .await?;
        Ok(())
    }

    async fn inspect_exit_code(&self, id: &str) -> Result<i64> {
        let output = self
            .run_docker_command(vec![
                "inspect".into(),
                "--format".into(),
                "{{.State.ExitCode}}".into(),
                id.into(),
            ])
            .await?;
        parse_status_code(&output, "docker inspect")
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run_docker_command(vec![
            "rm".into(),
            "--force".into(),
            "--volumes".into(),
            id.into(),
        ])
        .await?;
        Ok(())
    }
}
