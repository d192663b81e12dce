use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

mod classify;
mod config;
mod db;
mod devices;
mod error;
mod extract;
mod grid;
mod ledger;
mod logging;
mod models;
mod pipeline;
mod region;
mod report;
mod retry;
mod store;

use crate::config::{DatabaseSettings, OriginSettings, PipelineSettings};
use crate::db::PgStore;
use crate::extract::HttpSource;
use crate::models::{DateRange, RegionKind};
use crate::pipeline::{Pipeline, RunOutcome, RunRequest};
use crate::store::Store;

#[derive(Parser)]
#[command(name = "telemetry-grid-etl")]
#[command(about = "Incremental telemetry ETL: extract, classify, grid, assign regions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Run the pipeline once and print the result as JSON
    Run {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Ignore the ledger cursor and rewrite everything in range
        #[arg(long)]
        force_refresh: bool,
    },
    /// Run now and then every N minutes until interrupted
    Schedule {
        #[arg(long, env = "SCHEDULE_INTERVAL_MINUTES", default_value_t = 60)]
        interval_minutes: u64,
    },
    /// Load district or province boundaries from a GeoJSON file
    ImportRegions {
        #[arg(long, value_enum)]
        kind: RegionKind,
        #[arg(long)]
        path: PathBuf,
        /// Delete existing regions of this kind first
        #[arg(long)]
        replace: bool,
    },
    /// Write a markdown report of recent runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Print to stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_from_env()?;
    let cli = Cli::parse();

    let database = DatabaseSettings::from_env().context("invalid database settings")?;
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(&database.url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Run {
            start_date,
            end_date,
            force_refresh,
        } => {
            let range = DateRange {
                start: start_date,
                end: end_date,
            };
            if let (Some(start), Some(end)) = (range.start, range.end) {
                anyhow::ensure!(start <= end, "--start-date must not be after --end-date");
            }
            let pipeline = build_pipeline(store)?;
            let cancel = cancel_on_ctrl_c();
            let report = pipeline
                .run(
                    RunRequest {
                        range,
                        force_refresh,
                    },
                    &cancel,
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == RunOutcome::Failed {
                std::process::exit(1);
            }
        }
        Commands::Schedule { interval_minutes } => {
            anyhow::ensure!(interval_minutes > 0, "--interval-minutes must be > 0");
            let pipeline = build_pipeline(store)?;
            let cancel = cancel_on_ctrl_c();
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(interval_minutes, "scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = pipeline.run(RunRequest::default(), &cancel).await;
                        println!("{}", serde_json::to_string(&report)?);
                    }
                }
            }
            tracing::info!("scheduler stopped");
        }
        Commands::ImportRegions {
            kind,
            path,
            replace,
        } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let collection: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            let regions = region::regions_from_feature_collection(kind, &collection)?;
            let inserted = store.insert_regions(kind, &regions, replace).await?;
            println!("Inserted {inserted} {kind} regions from {}.", path.display());
        }
        Commands::History { limit, out } => {
            let entries = store.recent_ledger(limit).await?;
            let last_success = store.last_success().await?;
            let report = report::build_history(Utc::now(), last_success.as_ref(), &entries);
            match out {
                Some(out) => {
                    std::fs::write(&out, report)?;
                    println!("Report written to {}.", out.display());
                }
                None => print!("{report}"),
            }
        }
    }

    Ok(())
}

fn build_pipeline(store: PgStore) -> anyhow::Result<Pipeline> {
    let origin = OriginSettings::from_env().context("invalid origin settings")?;
    let settings = PipelineSettings::from_env().context("invalid pipeline settings")?;
    let source = HttpSource::new(&origin).context("failed to build origin client")?;
    Ok(Pipeline::new(
        Arc::new(store),
        Arc::new(source),
        origin.page_size(),
        origin.retry_policy(),
        settings,
    ))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after the current stage");
            trigger.cancel();
        }
    });
    cancel
}
