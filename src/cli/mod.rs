//! Command-line interface for audio-etl.
//!
//! The scheduler calls `bronze`, `silver` or `run` as its trigger; operators
//! use `status`, `pending` and `config` to inspect a deployment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};

use crate::checkpoint::CheckpointStatus;
use crate::config::{paths, PipelineConfig, ResolvedConfig};
use crate::domain::{BronzeFileRecord, DeadLetterRecord, SilverAudioRecord};
use crate::stages::{self, silver, DiscoveryStage, EnrichmentStage, RunSummary, Trigger};
use crate::storage::{watch_prefix, LocalVolume, PrefixWatcher};
use crate::table::Table;

/// audio-etl - Incremental audio file ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "audio-etl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .audio-etl/pipeline.yaml in this or a parent directory)
    #[arg(short, long, global = true, env = "AUDIO_ETL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover new files and append them to the bronze table
    Bronze {
        /// Keep running and poll for new files
        #[arg(long)]
        continuous: bool,
    },

    /// Enrich new bronze records into the silver table
    Silver {
        /// Keep running and poll for new bronze records
        #[arg(long)]
        continuous: bool,
    },

    /// Run bronze then silver
    Run {
        /// Keep both stages running
        #[arg(long)]
        continuous: bool,
    },

    /// Show checkpoint and table status
    Status,

    /// List silver records waiting for transcription
    Pending {
        /// Maximum number of records to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let resolved = ResolvedConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;
        if let Some(file) = &resolved.config_file {
            tracing::debug!("Using config file {}", file.display());
        }
        let config = resolved.config.clone();

        match self.command {
            Commands::Bronze { continuous } => {
                let summary = run_bronze(&config, trigger_for(&config, continuous)).await?;
                print_summary("bronze", &summary);
                Ok(())
            }
            Commands::Silver { continuous } => {
                let summary = run_silver(&config, trigger_for(&config, continuous)).await?;
                print_summary("silver", &summary);
                Ok(())
            }
            Commands::Run { continuous } => {
                run_all(&config, trigger_for(&config, continuous)).await
            }
            Commands::Status => show_status(&config).await,
            Commands::Pending { limit } => show_pending(&config, limit).await,
            Commands::Config => show_config(&resolved),
        }
    }
}

/// `--continuous` forces continuous mode; otherwise the configured trigger applies
fn trigger_for(config: &PipelineConfig, continuous: bool) -> Trigger {
    if continuous {
        Trigger::Continuous {
            interval: Duration::from_secs(config.trigger.interval_secs),
        }
    } else {
        Trigger::from(&config.trigger)
    }
}

/// Shutdown signal flipped by Ctrl+C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current batch");
            let _ = tx.send(true);
        }
    });

    rx
}

/// Filesystem wake-ups for the local storage prefix, if enabled
fn bronze_wakeups(
    config: &PipelineConfig,
    prefix: &str,
    trigger: Trigger,
) -> Option<(PrefixWatcher, mpsc::Receiver<()>)> {
    if matches!(trigger, Trigger::AvailableNow) || config.trigger.watch_debounce_ms == 0 {
        return None;
    }

    match watch_prefix(
        Path::new(prefix),
        Duration::from_millis(config.trigger.watch_debounce_ms),
    ) {
        Ok(watching) => Some(watching),
        Err(e) => {
            tracing::warn!(
                prefix,
                error = %e,
                "Cannot watch storage prefix, relying on interval only"
            );
            None
        }
    }
}

async fn open_bronze(config: &PipelineConfig) -> Result<DiscoveryStage> {
    DiscoveryStage::open(config, Arc::new(LocalVolume::new())).await
}

async fn run_bronze(config: &PipelineConfig, trigger: Trigger) -> Result<RunSummary> {
    let mut stage = open_bronze(config).await?;
    let (_watcher, wake) = match bronze_wakeups(config, stage.prefix(), trigger) {
        Some((watcher, wake)) => (Some(watcher), Some(wake)),
        None => (None, None),
    };

    stages::run_stage(&mut stage, trigger, wake, shutdown_signal()).await
}

async fn run_silver(config: &PipelineConfig, trigger: Trigger) -> Result<RunSummary> {
    let mut stage = EnrichmentStage::open(config).await?;
    stages::run_stage(&mut stage, trigger, None, shutdown_signal()).await
}

/// Run both stages: in order when draining, side by side when continuous
async fn run_all(config: &PipelineConfig, trigger: Trigger) -> Result<()> {
    match trigger {
        Trigger::AvailableNow => {
            let bronze = run_bronze(config, trigger).await?;
            print_summary("bronze", &bronze);
            let silver = run_silver(config, trigger).await?;
            print_summary("silver", &silver);
        }
        Trigger::Continuous { .. } => {
            let shutdown = shutdown_signal();

            let mut bronze = open_bronze(config).await?;
            let mut silver = EnrichmentStage::open(config).await?;
            // The watcher stays alive until both stages have stopped
            let (_watcher, wake) = match bronze_wakeups(config, bronze.prefix(), trigger) {
                Some((watcher, wake)) => (Some(watcher), Some(wake)),
                None => (None, None),
            };

            let bronze_shutdown = shutdown.clone();
            let bronze_task = tokio::spawn(async move {
                stages::run_stage(&mut bronze, trigger, wake, bronze_shutdown).await
            });
            let silver_task = tokio::spawn(async move {
                stages::run_stage(&mut silver, trigger, None, shutdown).await
            });

            let bronze = bronze_task.await.context("Bronze task panicked")??;
            let silver = silver_task.await.context("Silver task panicked")??;
            print_summary("bronze", &bronze);
            print_summary("silver", &silver);
        }
    }

    Ok(())
}

fn print_summary(stage: &str, summary: &RunSummary) {
    println!(
        "{}: {} batch(es), {} record(s), {} dead letter(s), {} dropped",
        stage, summary.batches, summary.records, summary.dead_letters, summary.dropped
    );
}

async fn show_status(config: &PipelineConfig) -> Result<()> {
    let schema_dir = paths::schema_dir(config);
    let bronze: Table<BronzeFileRecord> = Table::open(&schema_dir, paths::BRONZE_TABLE).await?;
    let silver: Table<SilverAudioRecord> = Table::open(&schema_dir, paths::SILVER_TABLE).await?;
    let dead: Table<DeadLetterRecord> = Table::open(&schema_dir, paths::DEAD_LETTER_TABLE).await?;

    println!("Storage prefix: {}", paths::storage_prefix(config));
    println!();
    println!("{:<34} {:>10} {:>10}", "TABLE", "VERSION", "ROWS");
    println!("{}", "-".repeat(56));
    for (name, version, rows) in [
        (bronze.name(), bronze.latest_version().await?, bronze.row_count().await?),
        (silver.name(), silver.latest_version().await?, silver.row_count().await?),
        (dead.name(), dead.latest_version().await?, dead.row_count().await?),
    ] {
        let version = version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{:<34} {:>10} {:>10}", name, version, rows);
    }

    println!();
    for (stage, table) in [("bronze", paths::BRONZE_TABLE), ("silver", paths::SILVER_TABLE)] {
        let dir = paths::checkpoint_dir(config, table);
        match CheckpointStatus::inspect(&dir)
            .await
            .with_context(|| format!("Failed to inspect checkpoint: {}", dir.display()))?
        {
            Some(status) => {
                let last_commit = status
                    .latest_commit
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let committed_at = status
                    .last_committed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("Checkpoint {} ({}):", stage, status.metadata.id);
                println!("  Last committed batch: {} at {}", last_commit, committed_at);
                if status.has_pending_batch() {
                    println!(
                        "  Pending batch: {:?} (re-runs on next trigger)",
                        status.latest_offset
                    );
                }
            }
            None => println!("Checkpoint {}: (not started)", stage),
        }
    }

    let pending = silver::pending_records(config, None).await?;
    println!();
    println!("Pending transcription: {}", pending.len());

    Ok(())
}

async fn show_pending(config: &PipelineConfig, limit: Option<usize>) -> Result<()> {
    let records = silver::pending_records(config, limit).await?;

    if records.is_empty() {
        println!("No pending records");
        return Ok(());
    }

    println!("{:<60} {:<6} {:>12} {:<25}", "PATH", "EXT", "BYTES", "INGESTED");
    println!("{}", "-".repeat(106));
    for record in records {
        println!(
            "{:<60} {:<6} {:>12} {:<25}",
            record.path,
            record.file_extension,
            record.file_size_bytes,
            record.ingested_at.to_rfc3339()
        );
    }

    Ok(())
}

fn show_config(resolved: &ResolvedConfig) -> Result<()> {
    let config = &resolved.config;

    println!(
        "Config file: {}",
        resolved
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using environment)".to_string())
    );
    println!();
    println!("Locations:");
    println!("  Storage prefix:   {}", paths::storage_prefix(config));
    println!("  Tables:           {}", paths::schema_dir(config).display());
    println!(
        "  Bronze checkpoint: {}",
        paths::checkpoint_dir(config, paths::BRONZE_TABLE).display()
    );
    println!(
        "  Silver checkpoint: {}",
        paths::checkpoint_dir(config, paths::SILVER_TABLE).display()
    );
    println!();

    let yaml = serde_yaml::to_string(config).context("Failed to render configuration")?;
    print!("{}", yaml);

    Ok(())
}
