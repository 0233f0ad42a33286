//! # metasieve CLI
//!
//! Command-line interface for metasieve, the capability-based metadata
//! extraction host.
//!
//! ## Commands
//!
//! - `metasieve scan` - Discover and load unit manifests
//! - `metasieve extract <FILE>` - Run all matching units against a file
//! - `metasieve status` - Show registry, memory and pool state
//! - `metasieve config` - Manage configuration
//!
//! ## Examples
//!
//! ```bash
//! # Load the module directory and report what is active
//! metasieve scan
//!
//! # Extract metadata from a file
//! metasieve extract ~/Pictures/photo.jpg
//!
//! # Keep running and re-extract whenever a manifest changes
//! metasieve extract ~/Pictures/photo.jpg --watch
//!
//! # Get JSON output
//! metasieve extract photo.jpg --format json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metasieve::config::Config;
use metasieve::{build_stack, units, Stack};
use metasieve_core::{ExtractionResult, FileDescriptor, UnitOutcome};
use metasieve_registry::ScanReport;
use metasieve_watch::HotReloadWatcher;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "metasieve")]
#[command(about = "Capability-based metadata extraction over pluggable units")]
#[command(version)]
struct Cli {
    /// Path to config file (default: ~/.config/metasieve/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and load unit manifests from the module directory
    Scan {
        /// Module directory (default: from config, then XDG data dir)
        #[arg(long)]
        modules_dir: Option<PathBuf>,
    },

    /// Extract metadata from a file using all matching units
    Extract {
        /// File to extract from
        file: PathBuf,

        /// Module directory (default: from config, then XDG data dir)
        #[arg(long)]
        modules_dir: Option<PathBuf>,

        /// Keep running; re-extract whenever a manifest changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show registry and memory state
    Status {
        /// Module directory (default: from config, then XDG data dir)
        #[arg(long)]
        modules_dir: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Print sample configuration file
    Init,
    /// Show config file path
    Path,
}

/// Output structure for scan results.
#[derive(Serialize)]
struct ScanOutput {
    modules_dir: String,
    total: usize,
    active: usize,
    version: u64,
    load_errors: Vec<LoadErrorItem>,
    cycle_members: Vec<String>,
}

#[derive(Serialize)]
struct LoadErrorItem {
    unit: String,
    error: String,
}

/// Output structure for status.
#[derive(Serialize)]
struct StatusOutput {
    modules_dir: String,
    version: u64,
    units: Vec<UnitItem>,
    pressure: metasieve_core::PressureLevel,
    resident_bytes: u64,
    available_bytes: u64,
    pool: metasieve_memory::PoolStats,
}

#[derive(Serialize)]
struct UnitItem {
    name: String,
    status: metasieve_core::UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from(cli.config.clone().or_else(Config::config_path))
        .context("Failed to load config")?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Scan { modules_dir } => {
            let dir = resolve_modules_dir(&config, modules_dir)?;
            let stack = build_stack(dir.clone(), &config);
            let report = stack.registry.scan().await.context("Scan failed")?;
            print_scan(&dir, &report, cli.format)?;
        }

        Commands::Extract {
            file,
            modules_dir,
            watch,
        } => {
            if !file.exists() {
                anyhow::bail!("File does not exist: {}", file.display());
            }
            let file = file.canonicalize()?;
            let dir = resolve_modules_dir(&config, modules_dir)?;
            let stack = build_stack(dir, &config);
            stack.registry.scan().await.context("Scan failed")?;

            let descriptor = FileDescriptor::from_path(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let result = stack.dispatcher.extract(descriptor.clone()).await;
            print_extraction(&file, &result, cli.format)?;

            if watch {
                run_watch_loop(&stack, &config, &file, descriptor, cli.format).await?;
            }
        }

        Commands::Status { modules_dir } => {
            let dir = resolve_modules_dir(&config, modules_dir)?;
            let stack = build_stack(dir.clone(), &config);
            stack.registry.scan().await.context("Scan failed")?;

            let snapshot = stack.registry.snapshot().await;
            let mem = stack.memory.snapshot();
            let output = StatusOutput {
                modules_dir: dir.to_string_lossy().to_string(),
                version: snapshot.version,
                units: snapshot
                    .units()
                    .map(|u| UnitItem {
                        name: u.name.clone(),
                        status: u.status,
                        detail: u.load_error.clone(),
                    })
                    .collect(),
                pressure: mem.pressure,
                resident_bytes: mem.resident_bytes,
                available_bytes: mem.available_bytes,
                pool: stack.streaming.pool().stats(),
            };

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
                OutputFormat::Text => {
                    println!("Registry at {} (version {})", output.modules_dir, output.version);
                    for unit in &output.units {
                        match &unit.detail {
                            Some(detail) => {
                                println!("  {:20} {:?}: {detail}", unit.name, unit.status);
                            }
                            None => println!("  {:20} {:?}", unit.name, unit.status),
                        }
                    }
                    println!(
                        "Memory: {:?} ({} resident, {} available)",
                        output.pressure, output.resident_bytes, output.available_bytes
                    );
                    println!(
                        "Pool: {} allocations, {} reuses, {} deallocations, {} idle",
                        output.pool.allocations,
                        output.pool.reuses,
                        output.pool.deallocations,
                        output.pool.idle_buffers
                    );
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => match cli.format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&config)
                            .context("Failed to serialize config")?
                    );
                }
                OutputFormat::Text => {
                    println!(
                        "{}",
                        toml::to_string_pretty(&config).context("Failed to serialize config")?
                    );
                }
            },
            ConfigAction::Init => println!("{}", Config::sample_toml()),
            ConfigAction::Path => {
                if let Some(path) = Config::config_path() {
                    println!("{}", path.display());
                } else {
                    println!("Could not determine config directory");
                }
            }
        },
    }

    Ok(())
}

/// Pick the module directory, seeding the built-in manifests on first use.
fn resolve_modules_dir(config: &Config, cli_override: Option<PathBuf>) -> Result<PathBuf> {
    let dir = config.modules_dir(cli_override)?;
    if !dir.exists() {
        info!("Seeding built-in unit manifests into {}", dir.display());
        units::write_default_manifests(&dir)
            .with_context(|| format!("Failed to create module directory {}", dir.display()))?;
    }
    Ok(dir)
}

/// Stay alive and re-extract on every applied manifest change.
async fn run_watch_loop(
    stack: &Stack,
    config: &Config,
    file: &PathBuf,
    descriptor: FileDescriptor,
    format: OutputFormat,
) -> Result<()> {
    let watcher = HotReloadWatcher::start(stack.registry.clone(), config.modules.debounce());
    if !watcher.is_active() {
        warn!("Watcher unavailable; exiting instead of blocking without reloads");
        return Ok(());
    }
    let mut updates = watcher.subscribe();
    info!("Watching for manifest changes. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        info!(?update, "registry updated, re-extracting");
                        let result = stack.dispatcher.extract(descriptor.clone()).await;
                        print_extraction(file, &result, format)?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

fn print_scan(dir: &PathBuf, report: &ScanReport, format: OutputFormat) -> Result<()> {
    let output = ScanOutput {
        modules_dir: dir.to_string_lossy().to_string(),
        total: report.total,
        active: report.active,
        version: report.version,
        load_errors: report
            .load_errors
            .iter()
            .map(|(unit, error)| LoadErrorItem {
                unit: unit.clone(),
                error: error.clone(),
            })
            .collect(),
        cycle_members: report.cycle_members.iter().cloned().collect(),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            println!(
                "Scanned {}: {} manifests, {} active (version {})",
                output.modules_dir, output.total, output.active, output.version
            );
            for item in &output.load_errors {
                println!("  load error: {}: {}", item.unit, item.error);
            }
            if !output.cycle_members.is_empty() {
                println!("  cycle: {}", output.cycle_members.join(", "));
            }
        }
    }
    Ok(())
}

fn print_extraction(file: &PathBuf, result: &ExtractionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!("Fields for {}:", file.display());
            for (key, entry) in &result.fields {
                println!("  {key} = {}  [{}]", entry.value, entry.unit);
            }
            println!("Units:");
            for report in &result.per_unit_status {
                match report.outcome {
                    UnitOutcome::Success => {
                        println!("  {:20} ok ({} ms)", report.unit, report.duration.as_millis());
                    }
                    UnitOutcome::Failed | UnitOutcome::Skipped => {
                        println!(
                            "  {:20} {:?}{}{}",
                            report.unit,
                            report.outcome,
                            report
                                .kind
                                .map(|k| format!(" ({k:?})"))
                                .unwrap_or_default(),
                            report
                                .detail
                                .as_ref()
                                .map(|d| format!(": {d}"))
                                .unwrap_or_default()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
