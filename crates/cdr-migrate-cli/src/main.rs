//! cdr-migrate CLI - resumable day-windowed CDR migration between SQL Server databases.

use cdr_migrate::{
    Config, MigrateError, MigrationOrchestrator, ProgressEvent, ProgressTracker, RunReport,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "cdr-migrate")]
#[command(about = "Resumable day-windowed migration of call detail records")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize and migrate until done (Ctrl-C stops, a second Ctrl-C aborts)
    Run {
        /// Stop after the day holding this many more call rows
        #[arg(long)]
        max_rows: Option<u64>,
    },

    /// Count rows and create the sync cursor table without migrating
    Init,

    /// Show the sync cursors and days pending
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run { max_rows } => {
            if let Some(rows) = max_rows {
                config.migration.max_rows_to_sync = rows;
            }

            let orchestrator = Arc::new(MigrationOrchestrator::connect(&config).await?);
            let done = CancellationToken::new();
            let forwarder =
                spawn_progress_forwarder(orchestrator.subscribe(), cli.progress, done.clone());
            spawn_signal_handler(orchestrator.clone());

            let result = match orchestrator.init().await {
                Ok(()) => orchestrator.start().await,
                Err(e) => Err(e),
            };

            if matches!(result, Err(MigrateError::Cancelled)) {
                // Aborted mid-iteration; constraints still need re-enabling
                if let Err(e) = orchestrator.stop().await {
                    warn!("Teardown after abort failed: {}", e);
                }
            }

            let tracker = finish_forwarder(forwarder, done).await;
            let report = result?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report, &tracker);
            }
        }

        Commands::Init => {
            let orchestrator = MigrationOrchestrator::connect(&config).await?;
            let done = CancellationToken::new();
            let forwarder =
                spawn_progress_forwarder(orchestrator.subscribe(), cli.progress, done.clone());

            let result = orchestrator.init().await;
            let tracker = finish_forwarder(forwarder, done).await;
            result?;

            let cursors = orchestrator.cursor_store().list_cursors().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&cursors)?);
            } else {
                println!("\nInitialized.");
                println!("{}", tracker.source_summary());
                println!("{}", tracker.target_summary());
            }
        }

        Commands::Status => {
            let orchestrator = MigrationOrchestrator::connect(&config).await?;
            let cursors = orchestrator.cursor_store().list_cursors().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&cursors)?);
            } else {
                println!("Sync cursors ({}):", orchestrator.cursor_store().backend_type());
                for cursor in &cursors {
                    println!(
                        "  {:<15} last synced: {:<10}  range: {} .. {}  days pending: {}",
                        cursor.related_table(),
                        show_date(cursor.last_synced_at),
                        show_date(cursor.min_date),
                        show_date(cursor.max_date),
                        cursor.days_pending()
                    );
                }
                println!(
                    "\nWindows left this run: {}",
                    orchestrator.plan_iterations().await?
                );
            }
        }
    }

    Ok(())
}

fn show_date<D: std::fmt::Display>(date: Option<D>) -> String {
    date.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
}

fn print_report(report: &RunReport, tracker: &ProgressTracker) {
    println!("\nMigration {}!", report.status);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Iterations: {}/{}",
        report.iterations_run, report.total_iterations
    );
    for (table, rows) in &report.rows_migrated {
        println!("  {}: {} rows", table, rows);
    }
    println!("  Rows: {}", report.total_rows());
    println!("\n{}", tracker.target_summary());
}

/// Forward progress events to the log, or as JSON lines to stderr.
///
/// The returned task folds every event into a [`ProgressTracker`] and ends
/// once `done` is cancelled and the channel is drained.
fn spawn_progress_forwarder(
    mut rx: broadcast::Receiver<ProgressEvent>,
    json: bool,
    done: CancellationToken,
) -> JoinHandle<ProgressTracker> {
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => forward(&mut tracker, &event, json),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Progress consumer lagged, {} events dropped", n)
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = done.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        forward(&mut tracker, &event, json);
                    }
                    break;
                }
            }
        }
        tracker
    })
}

fn forward(tracker: &mut ProgressTracker, event: &ProgressEvent, json: bool) {
    tracker.apply_event(event);

    if json {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
        return;
    }

    match event {
        ProgressEvent::Notification(n) => {
            if let Some(message) = &n.message {
                info!("{}", message);
            }
            if let (Some(field), Some(value)) = (&n.field, &n.value) {
                info!("{:?} = {}", field, value);
            }
        }
        ProgressEvent::StatusChanged { from, to } => info!("Status: {} -> {}", from, to),
    }
}

async fn finish_forwarder(
    forwarder: JoinHandle<ProgressTracker>,
    done: CancellationToken,
) -> ProgressTracker {
    done.cancel();
    forwarder.await.unwrap_or_default()
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// First signal stops at the next iteration boundary, the second aborts
/// in-flight database calls.
fn spawn_signal_handler(orchestrator: Arc<MigrationOrchestrator>) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        eprintln!("\nStopping after the current iteration (signal again to abort)...");

        let stopper = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = stopper.stop().await {
                warn!("Stop failed: {}", e);
            }
        });

        if wait_for_shutdown_signal().await.is_ok() {
            eprintln!("\nAborting in-flight work...");
            orchestrator.cancel();
        }
    });
}

/// Handles both SIGINT (Ctrl-C) and SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
