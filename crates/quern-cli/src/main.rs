//! quern: persistent background job queue.
//!
//! Submission, inspection and worker management front-end. User-input
//! problems (bad JSON, unknown states, jobs that are not where you think
//! they are) are reported on stdout and exit 0; the non-zero range is
//! reserved. Operational failures (unreachable store) propagate normally.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quern_core::{
    config, parse_run_at, JobState, JobSubmission, JobUpdate, Store, Supervisor, WorkerLoop,
};
use quern_store_sqlite::SqliteStore;

#[derive(Parser)]
#[command(name = "quern", version, about = "Persistent background job queue")]
struct Cli {
    /// Path to the queue database file
    #[arg(long, global = true, default_value = "queue.db", env = "QUERN_DB")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a new job to the queue from inline JSON or a file
    Enqueue(EnqueueArgs),
    /// List jobs, optionally filtered by state
    List {
        /// Filter by state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<String>,
        /// Also show stdout/stderr and scheduling details
        #[arg(long)]
        verbose: bool,
    },
    /// Show a summary of job states and basic metrics
    Status,
    /// Manage configuration values
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage workers
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Dead letter queue commands
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Serve the HTTP/WebSocket dashboard
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct EnqueueArgs {
    /// Inline JSON job definition; must include "id" and "command"
    job_json: Option<String>,
    /// Read the job definition from a JSON file instead
    #[arg(long = "file")]
    file: Option<PathBuf>,
    /// Job priority (higher is processed first)
    #[arg(long)]
    priority: Option<i64>,
    /// Job timeout in seconds
    #[arg(long)]
    timeout: Option<i64>,
    /// Schedule the first run at an ISO-8601 UTC time
    #[arg(long = "run-at")]
    run_at: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start workers that claim and execute jobs
    Start {
        /// Number of worker loops to run
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Run a single worker in the calling task, useful for debugging
        #[arg(long)]
        foreground: bool,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead jobs
    List,
    /// Move a dead job back to the queue
    Retry { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(SqliteStore::open(&cli.db).await?);
    store.init().await?;

    match cli.command {
        Command::Enqueue(args) => {
            if let Err(err) = enqueue(store.as_ref(), args).await {
                println!("Error: {err:#}");
            }
        }
        Command::List { state, verbose } => list(store.as_ref(), state, verbose).await?,
        Command::Status => status(store.as_ref()).await?,
        Command::Config(ConfigCommand::Get { key }) => match store.get_config(&key).await? {
            Some(value) => println!("{key} = {value}"),
            None => println!("Not set."),
        },
        Command::Config(ConfigCommand::Set { key, value }) => {
            store.set_config(&key, &value).await?;
            println!("Config '{key}' set to {value}");
        }
        Command::Worker(WorkerCommand::Start { count, foreground }) => {
            start_workers(&cli.db, store.clone(), count, foreground).await?;
        }
        Command::Dlq(DlqCommand::List) => {
            let rows = store.list_jobs(Some(JobState::Dead)).await?;
            if rows.is_empty() {
                println!("No dead jobs.");
            }
            for job in rows {
                println!(
                    "{} | {} | attempts={} | priority={} | cmd={}",
                    job.id, job.state, job.attempts, job.priority, job.command
                );
            }
        }
        Command::Dlq(DlqCommand::Retry { job_id }) => dlq_retry(store.as_ref(), &job_id).await?,
        Command::Serve { bind } => {
            let token = std::env::var("DASHBOARD_TOKEN").ok();
            quern_dashboard::serve(store, bind, token).await?;
        }
    }
    Ok(())
}

async fn enqueue(store: &dyn Store, args: EnqueueArgs) -> Result<()> {
    let raw = match (&args.file, &args.job_json) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, Some(json)) => json.clone(),
        (None, None) => anyhow::bail!("either provide job JSON or use --file <path>"),
    };
    let mut submission: JobSubmission =
        serde_json::from_str(&raw).context("job JSON must include \"id\" and \"command\"")?;

    // CLI flags override JSON fields.
    if args.priority.is_some() {
        submission.priority = args.priority;
    }
    if args.timeout.is_some() {
        submission.timeout = args.timeout;
    }
    if let Some(run_at) = &args.run_at {
        submission.next_run_at = Some(parse_run_at(run_at)?);
    }

    let default_retries = config::default_max_retries(store).await;
    let job = submission.into_job(default_retries)?;
    store.save_job(&job).await?;
    println!(
        "Job '{}' enqueued. priority={} run_at={} timeout={}",
        job.id,
        job.priority,
        job.next_run_at,
        job.timeout
            .map_or_else(|| "none".to_string(), |t| t.to_string())
    );
    Ok(())
}

async fn list(store: &dyn Store, state: Option<String>, verbose: bool) -> Result<()> {
    let filter = match state.as_deref() {
        Some(raw) => match raw.parse::<JobState>() {
            Ok(state) => Some(state),
            Err(err) => {
                println!("Error: {err}");
                return Ok(());
            }
        },
        None => None,
    };
    let rows = store.list_jobs(filter).await?;
    if rows.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    for job in rows {
        println!(
            "{} | {} | attempts={} | priority={} | cmd={}",
            job.id, job.state, job.attempts, job.priority, job.command
        );
        if verbose {
            println!("  stdout: {}", job.last_stdout.as_deref().unwrap_or("-"));
            println!("  stderr: {}", job.last_stderr.as_deref().unwrap_or("-"));
            println!("  next_run_at: {}", job.next_run_at);
        }
    }
    Ok(())
}

async fn status(store: &dyn Store) -> Result<()> {
    let summary = store.stats_summary().await?;
    println!("=== Queue Summary ===");
    for (state, count) in &summary {
        if state == "total" {
            println!("Total jobs: {count}");
        } else {
            println!("{state}: {count}");
        }
    }
    let jobs = store.list_jobs(None).await?;
    let avg = if jobs.is_empty() {
        0.0
    } else {
        jobs.iter().map(|j| j.attempts as f64).sum::<f64>() / jobs.len() as f64
    };
    println!("Avg attempts per job: {avg:.2}");
    Ok(())
}

async fn dlq_retry(store: &dyn Store, job_id: &str) -> Result<()> {
    let job = match store.get_job(job_id).await {
        Ok(job) => job,
        Err(quern_core::StoreError::NotFound(_)) => {
            println!("Job not found.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if job.state != JobState::Dead {
        println!("Job is not in DLQ.");
        return Ok(());
    }
    store.update_job_state(job_id, &JobUpdate::requeue()).await?;
    println!("Requeued {job_id} from DLQ.");
    Ok(())
}

async fn start_workers(
    db: &Path,
    store: Arc<SqliteStore>,
    count: usize,
    foreground: bool,
) -> Result<()> {
    let supervisor = Supervisor::new();
    supervisor.spawn_signal_listener();

    if foreground {
        println!("Starting 1 worker (foreground). Press Ctrl+C to stop.");
        let worker = WorkerLoop::new(store, supervisor.shutdown_token());
        worker.run().await?;
        return Ok(());
    }

    println!("Starting {count} worker(s). Press Ctrl+C to stop.");
    let mut workers = Vec::with_capacity(count);
    for _ in 0..count.max(1) {
        // Every worker gets its own store handle; the database file stays
        // the only coordination point.
        let worker_store = Arc::new(SqliteStore::open(db).await?);
        workers.push(WorkerLoop::new(worker_store, supervisor.shutdown_token()));
    }
    supervisor.run(workers).await
}
