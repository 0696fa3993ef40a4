//! CLI for the tierdown rollup engine.
//!
//! Runs the periodic rollup against a directory store and provides commands
//! for inspecting the configuration and the tables a run would touch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use tierdown::config::{FileConfig, TierdownConfig};
use tierdown::report::RunReporter;
use tierdown::run::{RunController, RunSettings, ShutdownHandle};
use tierdown::{DirStore, RetentionConfiguration, RetentionTable, Store};
use tracing_subscriber::EnvFilter;

/// tierdown — Scheduled rollup of time-series tables across retention levels.
#[derive(Parser)]
#[command(name = "tierdown", version, about)]
struct Cli {
    /// Log filter used when `RUST_LOG` is not set (e.g. "debug", "tierdown=trace").
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the rollup now and then every `aggregator.frequency`.
    Run {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Path to the store directory.
        #[arg(long)]
        store: PathBuf,

        /// Execute a single run and exit; the exit code reflects its outcome.
        #[arg(long)]
        once: bool,

        /// Compute every reduction without modifying the store.
        #[arg(long)]
        dry_run: bool,

        /// Current time in seconds since the epoch (defaults to the clock).
        #[arg(long)]
        now: Option<u64>,
    },

    /// Show the processing order and the due tables of every level.
    Plan {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Path to the store directory.
        #[arg(long)]
        store: PathBuf,

        /// Current time in seconds since the epoch (defaults to the clock).
        #[arg(long)]
        now: Option<u64>,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// List the tables of a store and how they are interpreted.
    Tables {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Path to the store directory.
        #[arg(long)]
        store: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate a configuration file.
    Check {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

/// Output format for listings.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// A single JSON document.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run {
            config,
            store,
            once,
            dry_run,
            now,
        } => cmd_run(&config, &store, once, dry_run, now),
        Commands::Plan {
            config,
            store,
            now,
            format,
        } => cmd_plan(&config, &store, now, &format),
        Commands::Tables {
            config,
            store,
            format,
        } => cmd_tables(&config, &store, &format),
        Commands::Check { config } => cmd_check(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `tierdown run`.
fn cmd_run(
    config_path: &Path,
    store_path: &Path,
    once: bool,
    dry_run: bool,
    now: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = TierdownConfig::load(config_path)?;
    // Fail fast on a broken level graph; later runs re-read the file.
    config.retention()?;

    let mut settings = RunSettings::from(&config.aggregator);
    settings.access.dry_run |= dry_run;

    let store = Arc::new(DirStore::open(store_path)?);
    let reporter = Arc::new(RunReporter::new());
    let mut controller = RunController::new(
        Arc::new(FileConfig::new(config_path)),
        store,
        reporter.clone(),
        settings,
    )?;

    let signals = spawn_signal_listener(controller.shutdown_handle())?;

    if once {
        let summary = match now {
            Some(now) => controller.run_at(now),
            None => controller.run(),
        };
        controller.shutdown();

        let stats = reporter.statistics();
        println!(
            "state={:?} tasks={} failed={} points={} created={} dropped={}",
            summary.state,
            summary.tasks_submitted,
            summary.tasks_failed,
            stats.points_written(),
            stats.tables_created.len(),
            stats.tables_dropped.len()
        );
        if !summary.is_success() {
            return Err("run was not successful".into());
        }
        return Ok(());
    }

    tracing::info!(
        every = %format_duration_secs(config.aggregator.frequency.as_secs()),
        "starting periodic rollup"
    );
    loop {
        let started = Instant::now();
        match now {
            Some(now) => controller.run_at(now),
            None => controller.run(),
        };
        let wait = config.aggregator.frequency.saturating_sub(started.elapsed());
        if wait_for_next_run(&signals, wait) {
            break;
        }
    }

    // Let in-flight tasks finish before exiting.
    controller.shutdown();

    let totals = reporter.totals();
    tracing::info!(
        runs = totals.runs,
        runs_failed = totals.runs_failed,
        tasks = totals.tasks_terminated,
        tasks_failed = totals.tasks_failed,
        points = totals.points_written,
        "periodic rollup stopped"
    );
    Ok(())
}

/// Sleeps for `wait` unless a shutdown signal arrives first.
///
/// Returns `true` if the scheduler should stop.
fn wait_for_next_run(signals: &Receiver<&'static str>, wait: Duration) -> bool {
    match signals.recv_timeout(wait) {
        Err(RecvTimeoutError::Timeout) => false,
        Ok(_) | Err(RecvTimeoutError::Disconnected) => true,
    }
}

/// SIGINT and SIGTERM (Ctrl-C elsewhere).
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Registers the handlers. Must be called inside a tokio runtime.
    fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Waits for the first signal and returns its name.
    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            "ctrl-c"
        }
    }
}

/// Starts a thread that requests shutdown on the first SIGINT or SIGTERM.
///
/// The returned channel receives the signal name once shutdown was
/// requested.
fn spawn_signal_listener(shutdown: ShutdownHandle) -> std::io::Result<Receiver<&'static str>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut signals = {
        let _guard = runtime.enter();
        ShutdownSignals::install()?
    };

    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("tierdown-signals".to_string())
        .spawn(move || {
            let name = runtime.block_on(signals.recv());
            tracing::info!("received {name}, stopping after the current level");
            shutdown.request();
            let _ = tx.send(name);
        })?;
    Ok(rx)
}

/// Implements `tierdown plan`.
fn cmd_plan(
    config_path: &Path,
    store_path: &Path,
    now: Option<u64>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let retention = TierdownConfig::load(config_path)?.retention()?;
    let tables = parsed_tables(&DirStore::open(store_path)?, &retention)?;
    let now = now.unwrap_or_else(epoch_secs);

    let plan: Vec<(String, Option<String>, Vec<String>)> = retention
        .order()
        .map(|level| {
            let due = tables
                .iter()
                .filter(|t| t.level().name() == level.name() && t.is_due(now))
                .map(RetentionTable::name)
                .collect();
            (
                level.name().to_string(),
                retention.next_level(level).map(|next| next.name().to_string()),
                due,
            )
        })
        .collect();

    match format {
        OutputFormat::Text => {
            println!("Plan at {now}:");
            for (level, next, due) in &plan {
                let action = next.as_deref().map_or("drop".to_string(), |n| format!("-> {n}"));
                println!("  {level} ({action}): {} due", due.len());
                for table in due {
                    println!("    {table}");
                }
            }
            println!("Note: tables written during a run may cascade into later levels.");
        }
        OutputFormat::Json => {
            let levels: Vec<serde_json::Value> = plan
                .iter()
                .map(|(level, next, due)| {
                    serde_json::json!({
                        "level": level,
                        "next": next,
                        "due": due,
                    })
                })
                .collect();
            let output = serde_json::json!({ "now": now, "levels": levels });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `tierdown tables`.
fn cmd_tables(
    config_path: &Path,
    store_path: &Path,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let retention = TierdownConfig::load(config_path)?.retention()?;
    let store = DirStore::open(store_path)?;

    let rows: Vec<serde_json::Value> = store
        .list_table_names()?
        .into_iter()
        .map(|name| match RetentionTable::from_name(&name, &retention) {
            Ok(table) => {
                let interval = table.interval();
                serde_json::json!({
                    "table": name,
                    "level": table.level().name(),
                    "block": table.block(),
                    "start": interval.start,
                    "end": interval.end,
                })
            }
            Err(reason) => serde_json::json!({
                "table": name,
                "rejected": reason.to_string(),
            }),
        })
        .collect();

    match format {
        OutputFormat::Text => {
            println!("Store: {}", store_path.display());
            println!("Tables: {}", rows.len());
            for row in &rows {
                let name = row["table"].as_str().unwrap_or_default();
                if let Some(reason) = row["rejected"].as_str() {
                    println!("  {name:<32} skipped: {reason}");
                } else {
                    println!(
                        "  {name:<32} level={} block={} [{}, {})",
                        row["level"].as_str().unwrap_or_default(),
                        row["block"],
                        row["start"],
                        row["end"]
                    );
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }

    Ok(())
}

/// Implements `tierdown check`.
fn cmd_check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = TierdownConfig::load(config_path)?;
    let retention = config.retention()?;

    println!("Configuration: {}", config_path.display());
    println!(
        "  pool_size={} frequency={} dry_run={}",
        config.aggregator.pool_size,
        format_duration_secs(config.aggregator.frequency.as_secs()),
        config.aggregator.dry_run
    );
    println!("Levels (processing order):");
    for level in retention.order() {
        println!(
            "  {:<12} every {:<6} blocks of {:<6} keep {:<3} next={}",
            level.name(),
            format_duration_secs(level.frequency()),
            format_duration_secs(level.block_size()),
            level.block_count(),
            level.next().unwrap_or("-")
        );
    }
    println!("Aggregation:");
    for rule in &retention.policy().rules {
        println!("  {:<24} {}", rule.pattern.as_str(), rule.function.name());
    }
    println!("  {:<24} {}", "(default)", retention.policy().default.name());

    Ok(())
}

fn parsed_tables(
    store: &DirStore,
    retention: &RetentionConfiguration,
) -> Result<Vec<RetentionTable>, Box<dyn std::error::Error>> {
    Ok(store
        .list_table_names()?
        .iter()
        .filter_map(|name| RetentionTable::from_name(name, retention).ok())
        .collect())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
