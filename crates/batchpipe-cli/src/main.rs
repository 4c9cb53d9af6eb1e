use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use serde_json::json;

use batchpipe::config::{apply_env_overrides, validate_config};
use batchpipe::logging::init_logging;
use batchpipe::progress::BatchStatus;
use batchpipe::queue::priority;
use batchpipe::{
    load_config, AcceleratorOrchestrator, BatchRequest, Config, Database, JobQueue, JobType,
    OllamaClient, QueueSettings, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "batchpipe")]
#[command(version)]
#[command(about = "Priority job queue and accelerator-aware OCR/extract/embed workers")]
#[command(propagate_version = true)]
struct Args {
    /// Config file (JSON or YAML)
    #[arg(long, short = 'c', global = true, env = "BATCHPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Job store path, overrides the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker pool; Ctrl-C stops it gracefully
    Run {
        /// Number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Jobs claimed per dequeue
        #[arg(long)]
        batch_size: Option<usize>,

        /// Jobs in flight per worker
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Enqueue one job per file as a batch
    Submit {
        #[arg(long)]
        space: String,

        /// ocr, extract, embed or full
        #[arg(long, default_value = "full")]
        job_type: String,

        #[arg(long, default_value_t = priority::NORMAL)]
        priority: i64,

        /// Target extraction schema
        #[arg(long)]
        schema: Option<String>,

        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Show progress for a space
    Status {
        #[arg(long)]
        space: String,
    },

    /// Show global queue statistics
    Stats,

    /// Show accelerator capacity
    Devices,

    /// Cancel one job
    Cancel { job_id: String },

    /// Cancel every job of a batch
    CancelBatch { batch_id: String },

    /// Run one lease reaping pass
    Reap,

    /// Check the job store, devices and inference service
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;
    init_logging(&config.logging)?;

    match args.command {
        Commands::Run {
            workers,
            batch_size,
            max_concurrent,
        } => {
            let mut config = config;
            if let Some(n) = workers {
                config.workers.count = n;
            }
            if let Some(n) = batch_size {
                config.workers.batch_size = n;
            }
            if let Some(n) = max_concurrent {
                config.workers.max_concurrent = n;
            }
            validate_config(&config)?;
            run(&config).await
        }
        Commands::Submit {
            space,
            job_type,
            priority,
            schema,
            files,
        } => {
            let job_type: JobType = job_type.parse().map_err(|e: String| anyhow!(e))?;
            let mut request = BatchRequest::new(space, files, job_type);
            request.priority = priority;
            request.schema = schema.unwrap_or_else(|| config.inference.default_schema.clone());

            let receipt = open_queue(&config)?.submit_batch(&request)?;
            print_json(&receipt)
        }
        Commands::Status { space } => {
            let progress = open_queue(&config)?.get_progress(&space)?;
            print_json(&BatchStatus::from_progress(progress))
        }
        Commands::Stats => print_json(&open_queue(&config)?.get_queue_stats()?),
        Commands::Devices => {
            let orchestrator = AcceleratorOrchestrator::from_config(&config.accelerator);
            print_json(&orchestrator.get_total_capacity().await)
        }
        Commands::Cancel { job_id } => {
            let outcome = open_queue(&config)?.cancel(&job_id)?;
            print_json(&json!({ "job_id": job_id, "outcome": outcome }))
        }
        Commands::CancelBatch { batch_id } => {
            print_json(&open_queue(&config)?.cancel_batch(&batch_id)?)
        }
        Commands::Reap => {
            let reaped = open_queue(&config)?.reap_expired()?;
            print_json(&json!({ "reaped": reaped }))
        }
        Commands::Health => health(&config).await,
    }
}

fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            validate_config(&config)?;
            config
        }
    };
    if let Some(path) = &args.database {
        config.database_path = Some(path.clone());
    }
    Ok(config)
}

fn open_queue(config: &Config) -> anyhow::Result<JobQueue> {
    let path = config
        .resolved_database_path()
        .ok_or_else(|| anyhow!("no job store path configured and no home directory found"))?;
    let db = Database::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(JobQueue::new(db, QueueSettings::from(&config.queue)))
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let pool = WorkerPool::from_config(config)?;
    let running = pool.start().await;

    let handle = running.handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handle.shutdown();
    })
    .context("installing Ctrl-C handler")?;

    let processed = running.wait().await?;
    info!("Processed {} job(s)", processed);
    Ok(())
}

async fn health(config: &Config) -> anyhow::Result<()> {
    let store = open_queue(config).and_then(|queue| Ok(queue.ping()?));
    let orchestrator = AcceleratorOrchestrator::from_config(&config.accelerator);
    let devices = orchestrator.get_status(true).await;
    let inference = match OllamaClient::from_config(&config.inference) {
        Ok(client) => client.health_check().await,
        Err(_) => false,
    };

    let healthy = store.is_ok() && inference;
    print_json(&json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "store": store.as_ref().map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string()),
        "devices": devices.len(),
        "inference": inference,
    }))?;

    if healthy {
        Ok(())
    } else {
        Err(anyhow!("health check failed"))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
