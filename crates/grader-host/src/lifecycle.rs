// Fleet lifecycle (Auto Scaling launch hooks), instance identity, draining
// and termination signals.

use anyhow::{Context, Result};
use async_trait::async_trait;
use grader_common::constants::DRAIN_POLL_INTERVAL;
use grader_common::{GraderConfig, HostContext, ShutdownReason};
use grader_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;

/// Instance metadata service (IMDSv2).
pub const INSTANCE_METADATA_URL: &str = "http://169.254.169.254";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
const METADATA_TOKEN_TTL_SECONDS: &str = "21600";

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// The fleet manager's view of this instance.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Initialization finished; the instance may receive work.
    async fn in_service(&self) -> Result<()>;

    /// The instance is broken and should be replaced.
    async fn abandon_launch(&self) -> Result<()>;
}

/// Used when not running in a fleet.
#[derive(Debug, Default)]
pub struct NoopLifecycle;

#[async_trait]
impl Lifecycle for NoopLifecycle {
    async fn in_service(&self) -> Result<()> {
        Ok(())
    }

    async fn abandon_launch(&self) -> Result<()> {
        Ok(())
    }
}

/// Completes the Auto Scaling launch lifecycle hook of this instance.
pub struct AutoScalingLifecycle {
    client: aws_sdk_autoscaling::Client,
    instance_id: String,
    group_name: String,
    hook_name: Option<String>,
}

impl AutoScalingLifecycle {
    /// Resolve the Auto Scaling group this instance belongs to.
    pub async fn init(
        client: aws_sdk_autoscaling::Client,
        config: &GraderConfig,
        instance_id: String,
    ) -> Result<Self> {
        let group_name = match config.auto_scaling_group_name.clone() {
            Some(name) if !name.is_empty() => name,
            _ => {
                let output = client
                    .describe_auto_scaling_instances()
                    .instance_ids(&instance_id)
                    .send()
                    .await
                    .context("Failed to describe Auto Scaling instance")?;
                output
                    .auto_scaling_instances()
                    .first()
                    .and_then(|i| i.auto_scaling_group_name())
                    .map(str::to_string)
                    .with_context(|| {
                        format!("Instance {instance_id} is not in an Auto Scaling group")
                    })?
            }
        };
        tracing::info!(
            instance_id = %instance_id,
            group = %group_name,
            "Auto Scaling lifecycle initialized"
        );

        Ok(Self {
            client,
            instance_id,
            group_name,
            hook_name: config.lifecycle_hook_name.clone().filter(|h| !h.is_empty()),
        })
    }

    async fn complete_launch(&self, result: &str) -> Result<()> {
        let Some(hook_name) = self.hook_name.as_deref() else {
            anyhow::bail!("No lifecycle hook configured");
        };
        self.client
            .complete_lifecycle_action()
            .auto_scaling_group_name(&self.group_name)
            .lifecycle_hook_name(hook_name)
            .instance_id(&self.instance_id)
            .lifecycle_action_result(result)
            .send()
            .await
            .with_context(|| format!("Failed to complete lifecycle action with {result}"))?;
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for AutoScalingLifecycle {
    async fn in_service(&self) -> Result<()> {
        if self.hook_name.is_none() {
            tracing::info!("No lifecycle hook configured; nothing to complete");
            return Ok(());
        }
        self.complete_launch("CONTINUE").await?;
        tracing::info!("Lifecycle hook completed; instance is in service");
        Ok(())
    }

    /// Abandon the launch, or mark the instance unhealthy when the hook is
    /// no longer pending (the instance already went in service).
    async fn abandon_launch(&self) -> Result<()> {
        match self.complete_launch("ABANDON").await {
            Ok(()) => {
                tracing::info!("Launch abandoned");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Could not abandon launch ({e:#}); marking instance unhealthy");
                self.client
                    .set_instance_health()
                    .instance_id(&self.instance_id)
                    .health_status("Unhealthy")
                    .should_respect_grace_period(false)
                    .send()
                    .await
                    .context("Failed to mark instance unhealthy")?;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Instance identity
// ---------------------------------------------------------------------------

/// Fetch this instance's id from the metadata service at `base_url`.
pub async fn fetch_instance_id(http: &reqwest::Client, base_url: &str) -> Result<String> {
    let token = http
        .put(format!("{base_url}/latest/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", METADATA_TOKEN_TTL_SECONDS)
        .timeout(METADATA_TIMEOUT)
        .send()
        .await
        .context("Failed to request an instance metadata token")?
        .error_for_status()
        .context("Instance metadata token request was rejected")?
        .text()
        .await?;

    let instance_id = http
        .get(format!("{base_url}/latest/meta-data/instance-id"))
        .header("X-aws-ec2-metadata-token", token)
        .timeout(METADATA_TIMEOUT)
        .send()
        .await
        .context("Failed to request the instance id")?
        .error_for_status()
        .context("Instance id request was rejected")?
        .text()
        .await?;
    Ok(instance_id.trim().to_string())
}

/// The configured instance id, else the EC2 instance id when running in
/// EC2, else the host name.
pub async fn resolve_instance_id(config: &GraderConfig, metadata_url: &str) -> Result<String> {
    if let Some(id) = config.instance_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if config.running_in_ec2 {
        let http = reqwest::Client::new();
        return fetch_instance_id(&http, metadata_url).await;
    }
    let name = hostname::get().context("Failed to read the host name")?;
    Ok(name.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// Draining
// ---------------------------------------------------------------------------

/// Resolves once the host is terminating and no job is in flight.
pub async fn wait_for_drain(context: &HostContext) {
    context.shutdown_token().cancelled().await;
    let trace = context.get_trace("DrainManager");
    loop {
        let in_flight = context.load().current_jobs();
        if in_flight == 0 {
            trace.info("All jobs finished; exiting");
            return;
        }
        trace.info(&format!("Waiting for {in_flight} in-flight job(s) to finish"));
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

/// Start draining on SIGTERM or SIGINT.
#[cfg(unix)]
pub fn install_signal_handlers(context: Arc<HostContext>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                _ = sigterm.recv() => ShutdownReason::Terminated,
                _ = sigint.recv() => ShutdownReason::Interrupted,
            };
            context.begin_shutdown(reason);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers(context: Arc<HostContext>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            context.begin_shutdown(ShutdownReason::Interrupted);
        }
    });
    Ok(())
}
