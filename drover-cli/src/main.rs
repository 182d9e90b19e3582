//! Drover CLI - inspect a fleet supervisor's persisted state

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_core::config::DroverConfig;
use drover_core::crash::{CrashRegistry, RestartPolicy};
use drover_core::ledger::CostLedger;
use drover_core::storage::{EventLog, LogEntry, LogRecord, MarkerStatus, RunningMarker};
use drover_core::transcript::{check_transcripts, default_transcript_root, remove_critical};
use drover_supervisor::FleetStatus;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Drover fleet supervisor CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to drover.toml plus DROVER_* overrides)
    #[arg(long, global = true, env = "DROVER_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show supervisor and fleet status
    Status,
    /// Show recorded spend
    Cost {
        /// Only this worker
        #[arg(short, long)]
        worker: Option<String>,
        /// Only this unit of work
        #[arg(short, long)]
        unit: Option<String>,
    },
    /// Show the event log
    Events {
        /// Only records about this worker
        #[arg(short, long)]
        worker: Option<String>,
        /// Show at most this many of the latest records
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
    /// Scan session transcripts for broken sessions
    CheckSessions {
        /// Directory to scan
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Print reports as JSON
        #[arg(long)]
        json: bool,
        /// Delete transcripts with critical issues
        #[arg(long)]
        fix: bool,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("drover {}", env!("CARGO_PKG_VERSION"));
            println!("drover-core {}", drover_core::VERSION);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Status => show_status(&load_config(cli.config.as_ref())?)?,
        Commands::Cost { worker, unit } => {
            show_cost(&load_config(cli.config.as_ref())?, worker, unit)?
        }
        Commands::Events { worker, limit } => {
            show_events(&load_config(cli.config.as_ref())?, worker, limit)?
        }
        Commands::CheckSessions { path, json, fix } => check_sessions(path, json, fix)?,
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<DroverConfig> {
    let config = match path {
        Some(path) => DroverConfig::from_file(path)?,
        None => DroverConfig::load()?,
    };
    debug!(state_dir = %config.storage.state_dir.display(), "Configuration loaded");
    Ok(config)
}

fn show_status(config: &DroverConfig) -> Result<()> {
    let storage = &config.storage;

    match RunningMarker::inspect(&storage.marker_path())? {
        MarkerStatus::Running(marker) => println!(
            "Supervisor pid {} running since {}",
            marker.pid,
            marker.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        MarkerStatus::Stale(marker) => println!(
            "Supervisor pid {} is gone (stale marker from {})",
            marker.pid,
            marker.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        MarkerStatus::NotRunning => println!("Supervisor not running"),
    }

    let status_path = storage.status_path();
    match std::fs::read(&status_path) {
        Ok(data) => {
            let status: FleetStatus = serde_json::from_slice(&data)
                .with_context(|| format!("unreadable status file {}", status_path.display()))?;
            println!(
                "\nLast tick at {}",
                status.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("{}", status);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("\nNo tick recorded yet");
        }
        Err(e) => return Err(e.into()),
    }

    let crashes = CrashRegistry::load(
        storage.crashes_path(),
        RestartPolicy::from(&config.restart),
    )?;
    let mut trackers = crashes.trackers().peekable();
    if trackers.peek().is_some() {
        println!("\nCrashes:");
        for tracker in trackers {
            println!(
                "  {:<24} {:>3} crash(es), last {}{}",
                tracker.worker_id,
                tracker.crash_count,
                tracker.last_crash.format("%Y-%m-%d %H:%M:%S"),
                if tracker.gave_up { "  [gave up]" } else { "" }
            );
        }
    }
    Ok(())
}

fn show_cost(config: &DroverConfig, worker: Option<String>, unit: Option<String>) -> Result<()> {
    let ledger = CostLedger::load(config.storage.ledger_path())?;
    let limit = |value: Option<f64>| value.map_or("none".to_string(), |v| format!("${:.2}", v));

    if let Some(worker) = worker {
        println!(
            "Worker {}: ${:.4} (limit {})",
            worker,
            ledger.worker_total(&worker),
            limit(config.cost.per_worker_limit)
        );
        return Ok(());
    }
    if let Some(unit) = unit {
        println!(
            "Unit of work {}: ${:.4} (limit {})",
            unit,
            ledger.unit_total(&unit),
            limit(config.cost.per_unit_limit)
        );
        return Ok(());
    }

    println!(
        "Today: ${:.4} (limit {})",
        ledger.daily_total(),
        limit(config.cost.daily_limit)
    );
    println!("\nBy worker:");
    for (worker, spent) in ledger.workers() {
        println!("  {:<24} ${:.4}", worker, spent);
    }
    println!("\nBy unit of work:");
    for (unit, spent) in ledger.units_of_work() {
        println!("  {:<24} ${:.4}", unit, spent);
    }
    Ok(())
}

fn show_events(config: &DroverConfig, worker: Option<String>, limit: usize) -> Result<()> {
    let log = EventLog::new(config.storage.event_log_path());
    let records = match &worker {
        Some(worker) => log.read_for_worker(worker)?,
        None => log.read_all()?,
    };

    if records.is_empty() {
        println!("No events recorded in {}", log.path().display());
        return Ok(());
    }

    let skip = records.len().saturating_sub(limit);
    for record in &records[skip..] {
        println!("{}", describe(record));
    }
    Ok(())
}

fn describe(record: &LogRecord) -> String {
    let detail = match &record.entry {
        LogEntry::HealthTransition { from, to, reason } => match from {
            Some(from) => format!("health {} -> {}: {}", from, to, reason),
            None => format!("health {}: {}", to, reason),
        },
        LogEntry::Handoff(handoff) => {
            let outcome = match (&handoff.new_worker_id, &handoff.error) {
                (_, Some(error)) => format!("failed: {}", error),
                (Some(new_id), None) => format!("now {}", new_id),
                (None, None) => "ok".to_string(),
            };
            format!(
                "handoff {} {} -> {} ({})",
                handoff.trigger, handoff.source_model, handoff.target_model, outcome
            )
        }
        LogEntry::SessionRotated(rotation) => format!(
            "rotated {} to session {} at {} tokens",
            rotation.specialist, rotation.new_session, rotation.tokens_at_rotation
        ),
    };
    format!(
        "{} {:<20} {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.worker_id,
        detail
    )
}

fn check_sessions(path: Option<PathBuf>, json: bool, fix: bool) -> Result<()> {
    let root = path.unwrap_or_else(default_transcript_root);
    if !root.exists() {
        anyhow::bail!("transcript directory {} does not exist", root.display());
    }

    let reports = check_transcripts(&root);
    let flagged: Vec<_> = reports.iter().filter(|r| r.has_issues()).cloned().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&flagged)?);
    } else {
        println!("Scanned {} transcript(s) under {}", reports.len(), root.display());
        for report in &flagged {
            println!(
                "\n{} ({} KB, {} messages{})",
                report.name(),
                report.size_bytes / 1024,
                report.message_count,
                if report.is_sidechain { ", sidechain" } else { "" }
            );
            for issue in &report.issues {
                println!("  [{}] {}", issue.severity, issue.message);
            }
            for (command, uses) in &report.top_commands {
                println!("    {:>5}x {}", uses, command);
            }
        }
        if flagged.is_empty() {
            println!("All sessions look healthy");
        }
    }

    if fix {
        let removed = remove_critical(&flagged);
        if !json {
            println!("\nRemoved {} critical transcript(s)", removed.len());
        }
        for path in removed {
            debug!(path = %path.display(), "Removed transcript");
        }
    }
    Ok(())
}
