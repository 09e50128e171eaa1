// Entry point for the grader host process.
//
// Loads the configuration, wires the AWS, Docker and database services into
// a GraderHost, starts the health and load side tasks, and runs the worker
// loops until the host drains or becomes unhealthy.

use anyhow::{Context, Result};
use clap::Parser;
use grader_common::constants::{return_code, CONFIG_FILE_VARIABLE, EXIT_DELAY};
use grader_common::{GraderConfig, HostContext, LogFormat};
use grader_sdk::{GraderPackage, TraceWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use grader_host::aws::AwsClients;
use grader_host::blob_store::S3BlobStore;
use grader_host::bookkeeping::{
    CancellationCheck, LoadStore, LocalBookkeeping, PgBookkeeping, TimeReporter,
};
use grader_host::docker::DockerCommandManager;
use grader_host::health_check::{self, HealthMonitor};
use grader_host::host::{GraderHost, HostExit, HostServices};
use grader_host::lifecycle::{
    install_signal_handlers, resolve_instance_id, AutoScalingLifecycle, Lifecycle,
    NoopLifecycle, INSTANCE_METADATA_URL,
};
use grader_host::load_reporter::LoadReporter;
use grader_host::queue::{SqsJobQueue, SqsResultsQueue};

#[derive(Debug, Parser)]
#[command(name = "grader-host", version, about = "Runs external grading jobs from a queue")]
struct Cli {
    /// JSON configuration file. Environment overrides apply on top of it.
    #[arg(long, short, env = CONFIG_FILE_VARIABLE)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(return_code::TERMINATED_ERROR);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(cli: Cli) -> i32 {
    let config = match GraderConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return return_code::TERMINATED_ERROR;
        }
    };
    init_logging(config.log_format);

    tracing::info!("Starting {}", GraderPackage::banner());

    let context = HostContext::new(config);
    let trace = context.get_trace("Main");
    trace.info("Loaded config:");
    trace.info_object(&**context.config());

    let aws = AwsClients::load(context.config()).await;

    let lifecycle = match init_lifecycle(&context, &aws).await {
        Ok(lifecycle) => lifecycle,
        Err(e) => {
            trace.error_chain("Error initializing lifecycle", &e);
            return return_code::TERMINATED_ERROR;
        }
    };

    let side_tasks = CancellationToken::new();
    let host = match start(&context, &aws, &side_tasks).await {
        Ok(host) => host,
        Err(e) => {
            trace.error_chain("Error during startup", &e);
            abandon(&*lifecycle, &trace).await;
            side_tasks.cancel();
            return return_code::TERMINATED_ERROR;
        }
    };

    if let Err(e) = lifecycle.in_service().await {
        trace.error_chain("Error completing the launch lifecycle action", &e);
        abandon(&*lifecycle, &trace).await;
        side_tasks.cancel();
        return return_code::TERMINATED_ERROR;
    }
    if let Err(e) = install_signal_handlers(context.clone()) {
        trace.error_chain("Error installing signal handlers", &e);
        side_tasks.cancel();
        return return_code::TERMINATED_ERROR;
    }
    trace.info("Initialization complete; beginning to process jobs");

    let exit = host.run().await;
    side_tasks.cancel();
    match exit {
        HostExit::Drained => {
            trace.info(&format!(
                "Drained after {}; exiting",
                context
                    .shutdown_reason()
                    .map_or_else(|| "shutdown".to_string(), |r| r.to_string())
            ));
            return_code::SUCCESS
        }
        HostExit::Unhealthy(reason) => {
            trace.error(&format!("Host is unhealthy ({reason}); shutting down"));
            abandon(&*lifecycle, &trace).await;
            tokio::time::sleep(EXIT_DELAY).await;
            return_code::TERMINATED_ERROR
        }
    }
}

async fn abandon(lifecycle: &dyn Lifecycle, trace: &impl TraceWriter) {
    if let Err(e) = lifecycle.abandon_launch().await {
        trace.error(&format!("Error abandoning launch: {e:#}"));
    }
}

async fn init_lifecycle(context: &HostContext, aws: &AwsClients) -> Result<Arc<dyn Lifecycle>> {
    let config = context.config();
    if !config.running_in_ec2 {
        return Ok(Arc::new(NoopLifecycle));
    }
    let instance_id = resolve_instance_id(config, INSTANCE_METADATA_URL).await?;
    let lifecycle = AutoScalingLifecycle::init(aws.autoscaling.clone(), config, instance_id).await?;
    Ok(Arc::new(lifecycle))
}

/// Build the services, start the side tasks and preload images.
async fn start(
    context: &Arc<HostContext>,
    aws: &AwsClients,
    side_tasks: &CancellationToken,
) -> Result<Arc<GraderHost>> {
    let config = context.config();

    let runtime = Arc::new(
        DockerCommandManager::locate(&config.docker_path)
            .context("Failed to locate the Docker CLI")?,
    );
    let jobs_queue = SqsJobQueue::connect(
        aws.sqs.clone(),
        config.jobs_queue_name.as_deref(),
        config.jobs_queue_url.as_deref(),
    )
    .await
    .context("Failed to resolve the jobs queue")?;
    let results_queue = SqsResultsQueue::connect(
        aws.sqs.clone(),
        config.results_queue_name.as_deref(),
        config.results_queue_url.as_deref(),
    )
    .await
    .context("Failed to resolve the results queue")?;

    let (time_reporter, cancellation, load_store): (
        Arc<dyn TimeReporter>,
        Arc<dyn CancellationCheck>,
        Arc<dyn LoadStore>,
    ) = if config.use_database {
        let db = Arc::new(PgBookkeeping::connect_lazy(config)?);
        (db.clone(), db.clone(), db)
    } else {
        let local = Arc::new(LocalBookkeeping);
        (local.clone(), local.clone(), local)
    };

    if config.report_load {
        let instance_id = resolve_instance_id(config, INSTANCE_METADATA_URL).await?;
        let reporter = LoadReporter::new(
            context.load().clone(),
            load_store,
            instance_id,
            config.jobs_queue_label(),
            config.report_interval(),
            context.get_trace("LoadReporter"),
        );
        tokio::spawn(reporter.run(side_tasks.clone()));
    }

    if config.use_health_check {
        let monitor = HealthMonitor::new(
            runtime.clone(),
            context.health().clone(),
            config.health_check_interval(),
            context.get_trace("HealthMonitor"),
        );
        tokio::spawn(monitor.run(side_tasks.clone()));

        let server = health_check::serve(
            config.health_check_port,
            context.health().clone(),
            side_tasks.clone(),
        );
        let trace = context.get_trace("HealthCheck");
        tokio::spawn(async move {
            if let Err(e) = server.await {
                trace.error_chain("Health check server stopped", &e);
            }
        });
    }

    let host = GraderHost::new(
        context.clone(),
        HostServices {
            runtime,
            jobs_queue: Arc::new(jobs_queue),
            results_queue: Arc::new(results_queue),
            blob_store: Arc::new(S3BlobStore::new(aws.s3.clone())),
            time_reporter,
            cancellation,
        },
    );
    host.preload_images().await;
    Ok(host)
}
