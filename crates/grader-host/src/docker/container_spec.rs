// ContainerSpec: everything `docker create` needs for one grading job.

use crate::job_message::GradingJob;
use grader_common::constants::grading::CONTAINER_DIRECTORY;
use grader_common::ResourceLimits;
use grader_sdk::StringUtil;
use std::path::Path;
use uuid::Uuid;

/// Parameters of a grading container.
///
/// Containers never share IPC with the host, never dump core and have a
/// TTY so interpreters flush output line by line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique per execution: `grader-<jobId>-<uuid>`.
    pub name: String,
    pub image: String,
    /// Executable first, then its arguments.
    pub entrypoint: Vec<String>,
    /// `KEY=value` or bare `KEY`.
    pub environment: Vec<String>,
    /// `host:container` bind mounts.
    pub volumes: Vec<String>,
    pub network_disabled: bool,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    pub fn for_job(
        job: &GradingJob,
        run_image: &str,
        job_dir: &Path,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            name: format!(
                "grader-{}-{}",
                StringUtil::format_into_safe_filename(&job.job_id),
                Uuid::new_v4().simple()
            ),
            image: run_image.to_string(),
            entrypoint: job.entrypoint_args(),
            environment: job.container_environment(),
            volumes: vec![format!("{}:{CONTAINER_DIRECTORY}", job_dir.display())],
            network_disabled: !job.enable_networking,
            limits,
        }
    }

    /// Full argument vector for `docker create`.
    pub fn build_create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--tty".to_string(),
            "--ipc".to_string(),
            "private".to_string(),
            "--ulimit".to_string(),
            "core=0:0".to_string(),
        ];

        if self.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        args.extend(self.build_limit_args());
        args.extend(self.build_volume_args());
        args.extend(self.build_env_args());

        let mut entrypoint = self.entrypoint.iter();
        if let Some(executable) = entrypoint.next() {
            args.push("--entrypoint".to_string());
            args.push(executable.clone());
        }

        args.push(self.image.clone());
        args.extend(entrypoint.cloned());
        args
    }

    fn build_limit_args(&self) -> Vec<String> {
        let limits = &self.limits;
        let mut args = vec![
            "--memory".to_string(),
            limits.memory.to_string(),
            "--memory-swap".to_string(),
            limits.memory_swap.to_string(),
            "--cpu-period".to_string(),
            limits.cpu_period.to_string(),
            "--cpu-quota".to_string(),
            limits.cpu_quota.to_string(),
            "--pids-limit".to_string(),
            limits.pids_limit.to_string(),
        ];
        if limits.kernel_memory > 0 {
            args.push("--kernel-memory".to_string());
            args.push(limits.kernel_memory.to_string());
        }
        if limits.disk_quota > 0 {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}", limits.disk_quota));
        }
        args
    }

    fn build_volume_args(&self) -> Vec<String> {
        self.volumes
            .iter()
            .flat_map(|v| ["-v".to_string(), v.clone()])
            .collect()
    }

    fn build_env_args(&self) -> Vec<String> {
        self.environment
            .iter()
            .flat_map(|e| ["-e".to_string(), e.clone()])
            .collect()
    }
}
