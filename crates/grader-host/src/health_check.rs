// Health monitoring: periodic container runtime pings and the `/ping`
// endpoint used by the load balancer.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use grader_common::constants::unhealthy::DOCKER_PING_FAILED;
use grader_common::{HealthState, Tracing};
use grader_sdk::TraceWriter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::docker::ContainerRuntime;

// ---------------------------------------------------------------------------
// HTTP endpoint
// ---------------------------------------------------------------------------

async fn ping_handler(State(health): State<Arc<HealthState>>) -> (StatusCode, String) {
    match health.reason() {
        None => (StatusCode::OK, "Healthy".to_string()),
        Some(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unhealthy: {reason}"),
        ),
    }
}

pub fn router(health: Arc<HealthState>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .with_state(health)
}

/// Serve `/ping` on `port` until `shutdown` fires.
pub async fn serve(port: u16, health: Arc<HealthState>, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health check server on {addr}"))?;
    tracing::info!(addr = %addr, "Health check server listening");

    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Health check server failed")
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Pings the container runtime every interval. The first failed ping makes
/// the host unhealthy for good, and monitoring stops.
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    health: Arc<HealthState>,
    interval: Duration,
    trace: Tracing,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        health: Arc<HealthState>,
        interval: Duration,
        trace: Tracing,
    ) -> Self {
        Self {
            runtime,
            health,
            interval,
            trace,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            if !self.health.is_healthy() {
                return;
            }
            if let Err(e) = self.runtime.ping().await {
                self.trace.error_chain(DOCKER_PING_FAILED, &e);
                self.health.flag_unhealthy(format!("{DOCKER_PING_FAILED}: {e:#}"));
                return;
            }
            self.trace.verbose("Docker ping succeeded");
        }
    }
}
