// Bookkeeping store: job timestamps, cancellation checks and load reports.
// PostgreSQL when the database is enabled, the local clock otherwise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grader_common::GraderConfig;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Records when a job was received, started and finished.
#[async_trait]
pub trait TimeReporter: Send + Sync {
    async fn report_received_time(&self, job_id: &str) -> Result<DateTime<Utc>>;
    async fn report_start_time(&self, job_id: &str) -> Result<DateTime<Utc>>;
    async fn report_end_time(&self, job_id: &str) -> Result<DateTime<Utc>>;
}

/// Whether a job was canceled after it was submitted.
#[async_trait]
pub trait CancellationCheck: Send + Sync {
    async fn is_canceled(&self, job_id: &str) -> Result<bool>;
}

/// One row of the `grader_loads` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub instance_id: String,
    pub queue_name: String,
    pub average_jobs: f64,
    pub max_jobs: usize,
}

#[async_trait]
pub trait LoadStore: Send + Sync {
    async fn record_load(&self, report: &LoadReport) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

const UPDATE_RECEIVED_TIME: &str =
    "UPDATE grading_jobs SET grading_received_at = now() WHERE id = $1 RETURNING grading_received_at";
const UPDATE_START_TIME: &str =
    "UPDATE grading_jobs SET grading_started_at = now() WHERE id = $1 RETURNING grading_started_at";
const UPDATE_END_TIME: &str =
    "UPDATE grading_jobs SET grading_finished_at = now() WHERE id = $1 RETURNING grading_finished_at";
const CHECK_JOB_CANCELLATION: &str =
    "SELECT grading_request_canceled_at IS NOT NULL AS canceled FROM grading_jobs WHERE id = $1";
const UPSERT_LOAD: &str = "\
    INSERT INTO grader_loads (instance_id, date, queue_name, average_jobs, max_jobs) \
    VALUES ($1, now(), $2, $3, $4) \
    ON CONFLICT (instance_id) DO UPDATE SET \
        date = EXCLUDED.date, \
        queue_name = EXCLUDED.queue_name, \
        average_jobs = EXCLUDED.average_jobs, \
        max_jobs = EXCLUDED.max_jobs";

/// Grading job ids are the numeric primary keys of `grading_jobs`.
fn numeric_job_id(job_id: &str) -> Result<i64> {
    job_id
        .trim()
        .parse::<i64>()
        .with_context(|| format!("Job id '{job_id}' is not a numeric grading job id"))
}

pub struct PgBookkeeping {
    pool: PgPool,
}

impl PgBookkeeping {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazily connecting pool from the `postgresql*` settings.
    pub fn connect_lazy(config: &GraderConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new();
        if let Some(host) = config.postgresql_host.as_deref() {
            options = options.host(host);
        }
        if let Some(database) = config.postgresql_database.as_deref() {
            options = options.database(database);
        }
        if let Some(user) = config.postgresql_user.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = config.postgresql_password.as_deref() {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.postgresql_pool_size.max(1))
            .idle_timeout(Duration::from_millis(config.postgresql_idle_timeout_millis))
            .connect_lazy_with(options);
        Ok(Self::new(pool))
    }

    async fn update_time(&self, statement: &str, job_id: &str) -> Result<DateTime<Utc>> {
        let id = numeric_job_id(job_id)?;
        sqlx::query_scalar::<_, DateTime<Utc>>(statement)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to update grading job {job_id}"))
    }
}

#[async_trait]
impl TimeReporter for PgBookkeeping {
    async fn report_received_time(&self, job_id: &str) -> Result<DateTime<Utc>> {
        self.update_time(UPDATE_RECEIVED_TIME, job_id).await
    }

    async fn report_start_time(&self, job_id: &str) -> Result<DateTime<Utc>> {
        self.update_time(UPDATE_START_TIME, job_id).await
    }

    async fn report_end_time(&self, job_id: &str) -> Result<DateTime<Utc>> {
        self.update_time(UPDATE_END_TIME, job_id).await
    }
}

#[async_trait]
impl CancellationCheck for PgBookkeeping {
    async fn is_canceled(&self, job_id: &str) -> Result<bool> {
        let id = numeric_job_id(job_id)?;
        sqlx::query_scalar::<_, bool>(CHECK_JOB_CANCELLATION)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to check cancellation of grading job {job_id}"))
    }
}

#[async_trait]
impl LoadStore for PgBookkeeping {
    async fn record_load(&self, report: &LoadReport) -> Result<()> {
        sqlx::query(UPSERT_LOAD)
            .bind(&report.instance_id)
            .bind(&report.queue_name)
            .bind(report.average_jobs)
            .bind(i32::try_from(report.max_jobs).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await
            .context("Failed to record grader load")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Used when the database is disabled: times come from the local clock, no
/// job is ever canceled and load reports are only logged.
#[derive(Debug, Default)]
pub struct LocalBookkeeping;

#[async_trait]
impl TimeReporter for LocalBookkeeping {
    async fn report_received_time(&self, _job_id: &str) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn report_start_time(&self, _job_id: &str) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn report_end_time(&self, _job_id: &str) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[async_trait]
impl CancellationCheck for LocalBookkeeping {
    async fn is_canceled(&self, _job_id: &str) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl LoadStore for LocalBookkeeping {
    async fn record_load(&self, report: &LoadReport) -> Result<()> {
        tracing::info!(
            instance_id = %report.instance_id,
            queue_name = %report.queue_name,
            "Load: {:.2} of {} jobs",
            report.average_jobs,
            report.max_jobs
        );
        Ok(())
    }
}
