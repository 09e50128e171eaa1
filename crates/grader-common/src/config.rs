// Grader host configuration.
// Defaults, then an optional JSON file, then `GRADER_*` environment overrides.

use crate::constants::CONFIG_ENV_PREFIX;
use anyhow::{Context, Result};
use grader_sdk::StringUtil;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// LogFormat
// ---------------------------------------------------------------------------

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// ResourceLimits
// ---------------------------------------------------------------------------

/// Caps applied to every grading container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: u64,
    pub memory_swap: u64,
    /// `0` leaves kernel memory uncapped.
    pub kernel_memory: u64,
    /// `0` leaves disk usage uncapped.
    pub disk_quota: u64,
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub pids_limit: u64,
}

// ---------------------------------------------------------------------------
// GraderConfig
// ---------------------------------------------------------------------------

/// Complete process configuration.
///
/// Every key has a default, so a configuration file only needs to name the
/// queues. Keys are camelCase in JSON and `GRADER_SCREAMING_SNAKE` in the
/// environment (`maxConcurrentJobs` → `GRADER_MAX_CONCURRENT_JOBS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraderConfig {
    /// Number of independent worker loops.
    pub max_concurrent_jobs: usize,

    pub jobs_queue_name: Option<String>,
    pub jobs_queue_url: Option<String>,
    pub results_queue_name: Option<String>,
    pub results_queue_url: Option<String>,

    /// Added to the hard timeout when extending a message's visibility;
    /// covers the image pull and the uploads around the container run.
    pub visibility_timeout_margin_sec: u64,
    /// Timeout for jobs that do not declare one.
    pub default_timeout_sec: u64,

    pub use_health_check: bool,
    pub health_check_port: u16,
    pub health_check_interval_ms: u64,

    pub use_database: bool,
    pub report_load: bool,
    pub report_interval_sec: u64,

    pub use_image_preloading: bool,
    pub preload_images: Vec<String>,
    /// Pull-through registry that replaces the registry of every image.
    pub cache_image_registry: Option<String>,
    pub docker_path: String,

    pub grader_docker_memory: u64,
    pub grader_docker_memory_swap: u64,
    pub grader_docker_kernel_memory: u64,
    /// `--storage-opt size=…`; `0` (the default) leaves it off. A non-zero
    /// quota needs a storage driver that supports it, e.g. overlay2 on xfs
    /// mounted with `pquota`.
    pub grader_docker_disk_quota: u64,
    pub grader_docker_cpu_period: u64,
    pub grader_docker_cpu_quota: u64,
    pub grader_docker_pids_limit: u64,

    pub postgresql_host: Option<String>,
    pub postgresql_database: Option<String>,
    pub postgresql_user: Option<String>,
    pub postgresql_password: Option<String>,
    pub postgresql_pool_size: u32,
    pub postgresql_idle_timeout_millis: u64,

    pub running_in_ec2: bool,
    pub instance_id: Option<String>,
    pub auto_scaling_group_name: Option<String>,
    pub lifecycle_hook_name: Option<String>,
    pub aws_region: Option<String>,
    /// Endpoint override for S3/SQS emulators.
    pub aws_endpoint_url: Option<String>,

    pub log_format: LogFormat,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            jobs_queue_name: None,
            jobs_queue_url: None,
            results_queue_name: None,
            results_queue_url: None,
            visibility_timeout_margin_sec: 120,
            default_timeout_sec: 30,
            use_health_check: true,
            health_check_port: 4000,
            health_check_interval_ms: 30_000,
            use_database: false,
            report_load: false,
            report_interval_sec: 10,
            use_image_preloading: false,
            preload_images: Vec::new(),
            cache_image_registry: None,
            docker_path: "docker".to_string(),
            grader_docker_memory: 1 << 30,
            grader_docker_memory_swap: 1 << 30,
            grader_docker_kernel_memory: 1 << 29,
            grader_docker_disk_quota: 0,
            grader_docker_cpu_period: 100_000,
            grader_docker_cpu_quota: 90_000,
            grader_docker_pids_limit: 1024,
            postgresql_host: None,
            postgresql_database: None,
            postgresql_user: None,
            postgresql_password: None,
            postgresql_pool_size: 2,
            postgresql_idle_timeout_millis: 30_000,
            running_in_ec2: false,
            instance_id: None,
            auto_scaling_group_name: None,
            lifecycle_hook_name: None,
            aws_region: None,
            aws_endpoint_url: None,
            log_format: LogFormat::Text,
        }
    }
}

impl GraderConfig {
    /// Load defaults, the optional JSON file, then process environment
    /// overrides, and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Override keys from `lookup(GRADER_<KEY>)`.
    ///
    /// Values are coerced to the type of the field they replace: booleans go
    /// through `StringUtil::convert_to_bool`, lists are comma separated.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut map = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("configuration did not serialize to an object"),
        };

        let mut changed = false;
        for (key, current) in map.iter_mut() {
            let variable = env_key(key);
            let Some(raw) = lookup(&variable) else {
                continue;
            };
            *current = coerce(current, &raw)
                .with_context(|| format!("Invalid value '{raw}' for {variable}"))?;
            changed = true;
        }

        if changed {
            *self = serde_json::from_value(Value::Object(map))
                .context("Failed to apply environment overrides")?;
        }
        Ok(())
    }

    /// Reject configurations the host cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("maxConcurrentJobs must be at least 1");
        }
        if is_blank(&self.jobs_queue_name) && is_blank(&self.jobs_queue_url) {
            anyhow::bail!("jobsQueueName or jobsQueueUrl must be set");
        }
        if is_blank(&self.results_queue_name) && is_blank(&self.results_queue_url) {
            anyhow::bail!("resultsQueueName or resultsQueueUrl must be set");
        }
        for (name, value) in [
            ("jobsQueueUrl", &self.jobs_queue_url),
            ("resultsQueueUrl", &self.results_queue_url),
            ("awsEndpointUrl", &self.aws_endpoint_url),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                url::Url::parse(value).with_context(|| format!("{name} is not a valid URL"))?;
            }
        }
        if self.default_timeout_sec == 0 {
            anyhow::bail!("defaultTimeoutSec must be positive");
        }
        if self.grader_docker_memory == 0 {
            anyhow::bail!("graderDockerMemory must be positive");
        }
        // Equal caps leave the container no swap.
        if self.grader_docker_memory_swap != self.grader_docker_memory {
            anyhow::bail!("graderDockerMemorySwap must equal graderDockerMemory");
        }
        let memory = self.grader_docker_memory;
        let kernel = self.grader_docker_kernel_memory;
        if kernel < memory / 4 || kernel > memory / 4 * 3 {
            anyhow::bail!(
                "graderDockerKernelMemory must be about half of graderDockerMemory ({} bytes)",
                memory / 2
            );
        }
        if self.grader_docker_cpu_quota == 0 || self.grader_docker_cpu_period == 0 {
            anyhow::bail!("graderDockerCpuPeriod and graderDockerCpuQuota must be positive");
        }
        if self.use_database && is_blank(&self.postgresql_host) {
            anyhow::bail!("useDatabase requires postgresqlHost");
        }
        if self.use_health_check && self.health_check_interval_ms == 0 {
            anyhow::bail!("healthCheckIntervalMs must be positive when useHealthCheck is enabled");
        }
        if self.report_load && self.report_interval_sec == 0 {
            anyhow::bail!("reportIntervalSec must be positive when reportLoad is enabled");
        }
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory: self.grader_docker_memory,
            memory_swap: self.grader_docker_memory_swap,
            kernel_memory: self.grader_docker_kernel_memory,
            disk_quota: self.grader_docker_disk_quota,
            cpu_period: self.grader_docker_cpu_period,
            cpu_quota: self.grader_docker_cpu_quota,
            pids_limit: self.grader_docker_pids_limit,
        }
    }

    /// Queue name used when reporting load; falls back to the URL's last segment.
    pub fn jobs_queue_label(&self) -> String {
        if let Some(name) = self.jobs_queue_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.jobs_queue_url
            .as_deref()
            .and_then(|u| u.rsplit('/').next())
            .unwrap_or_default()
            .to_string()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_sec)
    }

    pub fn visibility_margin(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_margin_sec)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// `maxConcurrentJobs` → `GRADER_MAX_CONCURRENT_JOBS`.
pub fn env_key(camel: &str) -> String {
    let mut out = String::from(CONFIG_ENV_PREFIX);
    for (i, ch) in camel.chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
    }
    out
}

fn coerce(current: &Value, raw: &str) -> Result<Value> {
    Ok(match current {
        Value::Bool(_) => Value::Bool(
            StringUtil::convert_to_bool(raw)
                .ok_or_else(|| anyhow::anyhow!("expected a boolean"))?,
        ),
        Value::Number(_) => Value::Number(
            raw.trim()
                .parse::<u64>()
                .context("expected a non-negative integer")?
                .into(),
        ),
        Value::Array(_) => Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        ),
        _ => {
            if raw.is_empty() {
                Value::Null
            } else {
                Value::String(raw.to_string())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn queues() -> GraderConfig {
        GraderConfig {
            jobs_queue_name: Some("grading_jobs_dev".into()),
            results_queue_name: Some("grading_results_dev".into()),
            ..GraderConfig::default()
        }
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = GraderConfig::default();
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.default_timeout_sec, 30);
        assert_eq!(config.visibility_timeout_margin_sec, 120);
        assert_eq!(config.grader_docker_disk_quota, 0);
        assert_eq!(config.health_check_port, 4000);
        assert!(config.use_health_check);
        assert!(!config.use_database);

        let limits = config.resource_limits();
        assert_eq!(limits.memory, limits.memory_swap);
        assert_eq!(limits.kernel_memory * 2, limits.memory);
        assert_eq!(limits.cpu_period, 100_000);
        assert_eq!(limits.cpu_quota, 90_000);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"jobsQueueName":"jobs","resultsQueueUrl":"http://localhost:4566/000000000000/results","maxConcurrentJobs":2,"logFormat":"json"}}"#
        )
        .unwrap();

        let config = GraderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.jobs_queue_name.as_deref(), Some("jobs"));
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.default_timeout_sec, 30);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = GraderConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn env_key_is_screaming_snake() {
        assert_eq!(env_key("maxConcurrentJobs"), "GRADER_MAX_CONCURRENT_JOBS");
        assert_eq!(env_key("useDatabase"), "GRADER_USE_DATABASE");
        assert_eq!(env_key("awsRegion"), "GRADER_AWS_REGION");
    }

    #[test]
    fn env_overrides_are_typed() {
        let mut config = queues();
        config
            .apply_env_overrides(lookup(&[
                ("GRADER_MAX_CONCURRENT_JOBS", "8"),
                ("GRADER_USE_HEALTH_CHECK", "false"),
                ("GRADER_PRELOAD_IMAGES", "a:1, b:2,"),
                ("GRADER_POSTGRESQL_HOST", "db.internal"),
                ("GRADER_LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(config.max_concurrent_jobs, 8);
        assert!(!config.use_health_check);
        assert_eq!(config.preload_images, vec!["a:1", "b:2"]);
        assert_eq!(config.postgresql_host.as_deref(), Some("db.internal"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.jobs_queue_name.as_deref(), Some("grading_jobs_dev"));
    }

    #[test]
    fn bad_env_override_names_the_variable() {
        let mut config = queues();
        let err = config
            .apply_env_overrides(lookup(&[("GRADER_USE_DATABASE", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("GRADER_USE_DATABASE"));
    }

    #[test]
    fn validate_requires_queues() {
        let err = GraderConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("jobsQueueName"));

        let config = GraderConfig {
            jobs_queue_url: Some("https://sqs.us-east-2.amazonaws.com/1/jobs".into()),
            ..GraderConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resultsQueueName"));
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let mut config = queues();
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = queues();
        config.grader_docker_memory_swap = config.grader_docker_memory - 1;
        assert!(config.validate().is_err());

        let mut config = queues();
        config.use_database = true;
        assert!(config.validate().unwrap_err().to_string().contains("postgresqlHost"));

        let mut config = queues();
        config.jobs_queue_url = Some("not a url".into());
        assert!(config.validate().is_err());

        queues().validate().unwrap();
    }

    #[test]
    fn validate_keeps_swap_equal_to_memory() {
        let mut config = queues();
        config.grader_docker_memory_swap = config.grader_docker_memory * 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("graderDockerMemorySwap"));

        let mut config = queues();
        config.grader_docker_memory = 2 << 30;
        config.grader_docker_memory_swap = 2 << 30;
        config.grader_docker_kernel_memory = 1 << 30;
        config.validate().unwrap();
    }

    #[test]
    fn validate_keeps_kernel_memory_near_half() {
        for kernel in [0, 1 << 20, 1 << 30, 2 << 30] {
            let mut config = queues();
            config.grader_docker_kernel_memory = kernel;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("graderDockerKernelMemory"), "{kernel}");
        }

        let mut config = queues();
        config.grader_docker_kernel_memory = 600 << 20;
        config.validate().unwrap();
    }

    #[test]
    fn queue_label_prefers_name() {
        assert_eq!(queues().jobs_queue_label(), "grading_jobs_dev");
        let config = GraderConfig {
            jobs_queue_url: Some("https://sqs.us-east-2.amazonaws.com/1/jobs_prod".into()),
            ..GraderConfig::default()
        };
        assert_eq!(config.jobs_queue_label(), "jobs_prod");
    }
}
