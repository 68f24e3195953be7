use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tickwork_core::TickworkConfig;
use tickwork_scheduler::{
    Calculator, Job, JobStore, NewJob, SchedulerEngine, SqliteJobStore,
};
use tracing::{error, info, warn};

mod executors;

use executors::ExecutorRouter;

#[derive(Parser)]
#[command(name = "tickwork")]
#[command(about = "Recurring job scheduler")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler in the foreground (default)
    Run,
    /// Add a job to the store; the next `run` picks it up
    Add {
        #[arg(long)]
        name: String,
        /// Executor routing key: email, compute or report
        #[arg(long)]
        kind: String,
        /// Cron expression (`m h dom mon dow`) or PT interval
        #[arg(long)]
        schedule: String,
        /// JSON payload handed to the executor
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        max_runs: Option<u32>,
    },
    /// List stored jobs
    List,
    /// Preview upcoming due times for a schedule
    Next {
        schedule: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > TICKWORK_CONFIG env > ~/.tickwork/tickwork.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("TICKWORK_CONFIG").ok());
    let config = TickworkConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TickworkConfig::default()
    });

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Add {
            name,
            kind,
            schedule,
            payload,
            max_runs,
        } => {
            let mut req = NewJob::new(name, kind, schedule).with_payload(payload);
            req.max_runs = max_runs;
            add(&config, req).await
        }
        Commands::List => list(&config).await,
        Commands::Next { schedule, count } => next(&config, &schedule, count),
    }
}

async fn run(config: TickworkConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let executor = Arc::new(ExecutorRouter::with_builtins());
    info!(kinds = ?executor.kinds(), "executors registered");

    let engine = SchedulerEngine::start(config.scheduler, store, executor).await?;
    info!("tickwork running, press Ctrl+C to stop");

    shutdown_signal().await;
    engine.shutdown().await;
    Ok(())
}

async fn add(config: &TickworkConfig, req: NewJob) -> anyhow::Result<()> {
    validate_payload(&req.payload)?;

    let calculator = Calculator::new(config.scheduler.timezone);
    let due = calculator.next_run(&req.schedule, Utc::now())?;

    let store = open_store(config)?;
    let job = store.save(&Job::from_request(req, due)).await?;
    println!("{}  next due {}", job.id, due.to_rfc3339());
    Ok(())
}

async fn list(config: &TickworkConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let jobs = store.list().await?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<8}  {:<9}  {:>5}  {:>5}  {:<25}  SCHEDULE",
        "ID", "NAME", "KIND", "STATUS", "RUNS", "FAILS", "NEXT DUE"
    );
    for job in jobs {
        let next_due = job
            .next_due_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<16}  {:<8}  {:<9}  {:>5}  {:>5}  {:<25}  {}",
            job.id,
            job.name,
            job.kind,
            job.status,
            job.run_count,
            job.failure_count,
            next_due,
            job.schedule
        );
        if let Some(err) = job.last_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

fn next(config: &TickworkConfig, schedule: &str, count: usize) -> anyhow::Result<()> {
    let calculator = Calculator::new(config.scheduler.timezone);
    let mut at = Utc::now();
    for _ in 0..count {
        at = calculator.next_run(schedule, at)?;
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}

/// Executors receive the payload as-is, so reject anything that is not JSON.
fn validate_payload(payload: &str) -> tickwork_core::Result<()> {
    serde_json::from_str::<serde_json::Value>(payload)?;
    Ok(())
}

/// Open the SQLite job store, creating the database file and schema if needed.
fn open_store(config: &TickworkConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");

    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(Arc::new(SqliteJobStore::new(conn)?))
}

fn ensure_parent_dir(path: &str) -> tickwork_core::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
