use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lbx_sync::{build_engine, maybe_build_scheduler, report_recent_markdown, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "lbx-cli")]
#[command(about = "Local Business Index command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass against the table service.
    Sync {
        /// YAML config file; falls back to LBX_* environment variables.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Sync fixture records into an in-process table service.
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_yaml_file(path),
        None => Ok(SyncConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        config: None,
        dry_run: false,
    }) {
        Commands::Sync { config, dry_run } => {
            let engine = build_engine(load_config(config)?, dry_run).await?;
            let report = engine.run().await;
            println!(
                "sync complete: run_id={} status={:?} committed={} skipped={} pruned={} deferred={} warnings={}",
                report.run_id,
                report.status,
                report.committed,
                report.skipped,
                report.pruned,
                report.deferred_batches.len(),
                report.warnings.len()
            );
            if let Some(reason) = report.aborted_reason {
                eprintln!("run aborted: {reason}");
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, None)?);
        }
        Commands::Schedule { config } => {
            let mut config = load_config(config)?;
            config.scheduler_enabled = true;
            let engine = Arc::new(build_engine(config, false).await?);
            let Some(scheduler) = maybe_build_scheduler(Arc::clone(&engine)).await? else {
                anyhow::bail!("scheduler is disabled in the loaded config");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(
                crons = %format!("{}, {}", engine.config().sync_cron_1, engine.config().sync_cron_2),
                "scheduler running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
