// Container runtime seam and its Docker CLI implementation.

pub mod container_spec;
pub mod docker_command_manager;

pub use container_spec::ContainerSpec;
pub use docker_command_manager::DockerCommandManager;

use anyhow::Result;
use async_trait::async_trait;
use grader_common::JobLogger;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Operations the host needs from a container runtime.
///
/// Every call is independent; implementations hold no per-container state,
/// so one instance is shared by all worker loops.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails when the daemon is unreachable.
    async fn ping(&self) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container; returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Forward the container's output to `logger` until it exits or
    /// `cancel` fires.
    async fn follow_logs(
        &self,
        id: &str,
        logger: Arc<JobLogger>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Block until the container has stopped; returns the reported status code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    async fn inspect_exit_code(&self, id: &str) -> Result<i64>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
