use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use queuectl::config::{DataDir, OutputMode, QueueConfig, WorkerConfig};
use queuectl::lock::{FileLockCoordinator, LockCoordinator};
use queuectl::queue::{Job, JobQueue, JobSpec, StateFilter};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::store::JsonFileStore;
use queuectl::worker::{WorkerPidFile, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A local job queue with retries, backoff and a dead-letter queue")]
#[command(propagate_version = true)]
struct Args {
    /// Directory holding the job store, lock files and worker pid file
    #[arg(long, global = true, env = "QUEUECTL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add a job, given as JSON (e.g. '{"id":"job1","command":"sleep 2"}')
    Enqueue {
        /// Job JSON object with `command` and optional `id` and `max_retries`
        job: String,
    },

    /// Worker pool commands
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and the queue configuration
    Status,

    /// List jobs in the main queue
    List {
        /// Filter by state (all, pending, processing, completed, failed)
        #[arg(long, short, default_value = "all")]
        state: String,
    },

    /// Dead-letter queue commands
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Queue configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Run a worker pool in the foreground until SIGINT/SIGTERM
    Start {
        /// Number of concurrent workers
        #[arg(long, short, default_value = "1")]
        count: usize,

        /// Capture job output instead of passing it through
        #[arg(long)]
        capture_output: bool,
    },
    /// Ask a running worker pool to shut down gracefully
    Stop,
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs
    List,
    /// Move a dead job back to the queue with its attempts reset
    Retry {
        /// The job ID
        id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Set a configuration value (max-retries, backoff-base)
    Set { key: String, value: String },
    /// Show the current configuration
    Get,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn open_queue(data: &DataDir) -> Arc<JobQueue> {
    Arc::new(JobQueue::new(Arc::new(JsonFileStore::new(
        data.snapshot_path(),
    ))))
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Queue Commands
// =============================================================================

async fn handle_enqueue(queue: &JobQueue, raw: &str, output: &OutputFormat) -> CliResult {
    let spec: JobSpec = serde_json::from_str(raw).map_err(|e| format!("Invalid job JSON: {}", e))?;
    let job = queue.enqueue(spec).await?;

    match output {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => println!("Job enqueued: {}", job.id),
    }
    Ok(())
}

async fn handle_status(queue: &JobQueue, data: &DataDir, output: &OutputFormat) -> CliResult {
    let active = WorkerPidFile::new(data.pid_path())
        .live_record()?
        .map(|record| record.workers)
        .unwrap_or(0);
    let status = queue.status(active).await?;

    match output {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("Queue Status");
            println!("{}", "=".repeat(30));
            println!("Pending:        {}", status.pending);
            println!("Processing:     {}", status.processing);
            println!("Completed:      {}", status.completed);
            println!("Failed:         {}", status.failed);
            println!("Dead:           {}", status.dead);
            println!();
            println!("Max Retries:    {}", status.max_retries);
            println!("Backoff Base:   {}", status.backoff_base);
            println!("Active Workers: {}", status.active_workers);
        }
    }
    Ok(())
}

fn print_job_table(jobs: &[Job], config: &QueueConfig, empty: &str) {
    if jobs.is_empty() {
        println!("{}", empty);
        return;
    }
    println!(
        "{:<34} {:<11} {:<9} {:<20} COMMAND",
        "JOB ID", "STATE", "ATTEMPTS", "UPDATED"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<34} {:<11} {:<9} {:<20} {}",
            job.id,
            job.state,
            format!("{}/{}", job.attempts, job.effective_max_retries(config)),
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
            job.command
        );
        if let Some(ref error) = job.error_message {
            println!("    error: {}", error.lines().next().unwrap_or_default());
        }
    }
}

async fn handle_list(queue: &JobQueue, state: &str, output: &OutputFormat) -> CliResult {
    let filter: StateFilter = state.parse()?;
    let jobs = queue.list_jobs(filter).await?;

    match output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            let config = queue.get_config().await?;
            print_job_table(&jobs, &config, "No jobs found.");
        }
    }
    Ok(())
}

async fn handle_dlq(queue: &JobQueue, command: DlqCommands, output: &OutputFormat) -> CliResult {
    match command {
        DlqCommands::List => {
            let jobs = queue.list_dlq().await?;
            match output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    let config = queue.get_config().await?;
                    print_job_table(&jobs, &config, "Dead-letter queue is empty.");
                }
            }
        }
        DlqCommands::Retry { id } => {
            let job = queue.retry_from_dlq(&id).await?;
            match output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => println!("Job moved back to queue: {}", job.id),
            }
        }
    }
    Ok(())
}

async fn handle_config(
    queue: &JobQueue,
    command: ConfigCommands,
    output: &OutputFormat,
) -> CliResult {
    match command {
        ConfigCommands::Set { key, value } => {
            QueueConfig::validate_entry(&key, &value)?;
            queue.set_config(&key, &value).await?;
            if let OutputFormat::Table = output {
                println!("Config updated: {} = {}", key, value);
            }
        }
        ConfigCommands::Get => {
            let config = queue.get_config().await?;
            match output {
                OutputFormat::Json => print_json(&config)?,
                OutputFormat::Table => {
                    for (key, value) in config.entries() {
                        println!("{:<14} {}", key, value);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Worker Commands
// =============================================================================

async fn run_workers(data: &DataDir, count: usize, capture_output: bool) -> CliResult {
    let pid_file = WorkerPidFile::new(data.pid_path());
    pid_file.claim(count)?;

    let output = if capture_output {
        OutputMode::Capture
    } else {
        OutputMode::Inherit
    };
    let locks: Arc<dyn LockCoordinator> = Arc::new(FileLockCoordinator::new(data.locks_dir()));
    let pool = WorkerPool::new(
        open_queue(data),
        locks,
        WorkerConfig::default().with_output(output),
    );

    let shutdown = install_shutdown_handler();
    if let Err(e) = pool.start(count) {
        pid_file.remove()?;
        return Err(e.into());
    }
    println!(
        "Started {} worker(s) in process {}. Press Ctrl+C to stop.",
        count,
        std::process::id()
    );

    let drained = pool.run_until_shutdown(shutdown).await;
    pid_file.remove()?;
    if drained {
        println!("All workers stopped");
    } else {
        eprintln!("Warning: workers were still busy when the grace period ended");
    }
    Ok(())
}

async fn stop_workers(data: &DataDir) -> CliResult {
    let pid_file = WorkerPidFile::new(data.pid_path());
    let Some(pid) = pid_file.signal_stop()? else {
        println!("No running worker pool found.");
        return Ok(());
    };
    println!("Sent stop signal to worker pool (pid {}), waiting...", pid);

    // Pool grace period plus a little slack for the final store writes.
    let deadline = Instant::now() + WorkerConfig::default().shutdown_grace + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pid_file.live_record()?.is_none() {
            println!("All workers stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(format!("worker pool (pid {}) is still shutting down", pid).into())
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(args: Args) -> CliResult {
    let data = DataDir::new(args.data_dir);
    let output = args.output;

    // Workers log their progress; the other commands only surface problems.
    match args.command {
        Commands::Worker { .. } => init_logging("info"),
        _ => init_logging("warn"),
    }

    match args.command {
        Commands::Worker { command } => match command {
            WorkerCommands::Start {
                count,
                capture_output,
            } => run_workers(&data, count, capture_output).await,
            WorkerCommands::Stop => stop_workers(&data).await,
        },
        Commands::Enqueue { job } => handle_enqueue(&open_queue(&data), &job, &output).await,
        Commands::Status => handle_status(&open_queue(&data), &data, &output).await,
        Commands::List { state } => handle_list(&open_queue(&data), &state, &output).await,
        Commands::Dlq { command } => handle_dlq(&open_queue(&data), command, &output).await,
        Commands::Config { command } => handle_config(&open_queue(&data), command, &output).await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
