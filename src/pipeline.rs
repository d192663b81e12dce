//! Run controller: INIT → EXTRACT → TRANSFORM → LOAD → ASSIGN_REGIONS → RECORD_LEDGER.
//!
//! `Pipeline::run` never returns an error. Every outcome, including a refused or
//! failed run, comes back as a [`RunReport`], and every admitted run ends with a
//! terminal ledger row.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::classify::{classify_batch, ClassifiedBatch};
use crate::config::PipelineSettings;
use crate::devices::{aggregate_by_device, summarize};
use crate::error::{AssignmentError, ExtractionError, PipelineError};
use crate::extract::{Extractor, PageSource};
use crate::grid::{self, round_to};
use crate::ledger::{next_cursor, BeginOutcome, LedgerEntry};
use crate::models::{BatchSummary, DateRange, DeviceStats, GridCell, LoadMode, RegionKind};
use crate::region::RegionSet;
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Extract,
    Transform,
    Load,
    AssignRegions,
    RecordLedger,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Extract => "EXTRACT",
            Stage::Transform => "TRANSFORM",
            Stage::Load => "LOAD",
            Stage::AssignRegions => "ASSIGN_REGIONS",
            Stage::RecordLedger => "RECORD_LEDGER",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub range: DateRange,
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    NoData,
    Failed,
    Skipped,
}

/// Structured result handed back to the caller (and printed as JSON by the CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunOutcome,
    pub records_processed: usize,
    pub records_inserted: u64,
    pub records_filtered: usize,
    pub records_malformed: usize,
    pub grid_cells: usize,
    pub devices: usize,
    pub regions_assigned: usize,
    /// Seconds, two decimals.
    pub execution_time: f64,
    pub last_id: Option<i64>,
    pub message: String,
    pub statistics: Option<BatchSummary>,
}

impl RunReport {
    fn new(run_id: Uuid, status: RunOutcome, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status,
            records_processed: 0,
            records_inserted: 0,
            records_filtered: 0,
            records_malformed: 0,
            grid_cells: 0,
            devices: 0,
            regions_assigned: 0,
            execution_time: 0.0,
            last_id: None,
            message: message.into(),
            statistics: None,
        }
    }
}

struct Transformed {
    batch: ClassifiedBatch,
    cells: Vec<GridCell>,
    devices: Vec<DeviceStats>,
    summary: BatchSummary,
}

type StageResult<T> = Result<T, (Stage, PipelineError)>;

pub struct Pipeline {
    store: Arc<dyn Store>,
    source: Arc<dyn PageSource>,
    page_size: usize,
    policy: RetryPolicy,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn PageSource>,
        page_size: usize,
        policy: RetryPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            source,
            page_size,
            policy,
            settings,
        }
    }

    pub async fn run(&self, request: RunRequest, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "etl_run",
            %run_id,
            force_refresh = request.force_refresh
        );
        self.run_inner(run_id, request, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> RunReport {
        let clock = Instant::now();
        let started_at = Utc::now();
        tracing::info!(stage = %Stage::Init, start = ?request.range.start, end = ?request.range.end, "run starting");

        let prior = match self
            .store
            .begin_run(run_id, started_at, self.settings.run_lease)
            .await
        {
            Ok(BeginOutcome::Acquired { cursor }) => cursor,
            Ok(BeginOutcome::Busy { run_id: holder }) => {
                tracing::warn!(%holder, "another run is still active, skipping");
                let mut report = RunReport::new(
                    run_id,
                    RunOutcome::Skipped,
                    format!("run {holder} is still active"),
                );
                report.execution_time = elapsed_secs(clock);
                return report;
            }
            Err(err) => {
                let err = PipelineError::Ledger(err);
                tracing::error!(stage = %Stage::Init, error = %err, "run could not start");
                let mut report = RunReport::new(
                    run_id,
                    RunOutcome::Failed,
                    format!("{} failed: {err}", Stage::Init),
                );
                report.execution_time = elapsed_secs(clock);
                return report;
            }
        };

        let result = self.execute(run_id, request, prior, cancel).await;
        let mut report = match result {
            Ok((report, batch_max)) => {
                self.record_success(started_at, prior, batch_max, report)
                    .await
            }
            Err((stage, err)) => self.record_failure(run_id, started_at, prior, stage, err).await,
        };
        report.execution_time = elapsed_secs(clock);
        tracing::info!(
            status = ?report.status,
            records = report.records_processed,
            elapsed_secs = report.execution_time,
            "run finished"
        );
        report
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: RunRequest,
        prior: Option<i64>,
        cancel: &CancellationToken,
    ) -> StageResult<(RunReport, Option<i64>)> {
        checkpoint(cancel, Stage::Extract)?;
        let cursor = if request.force_refresh { None } else { prior };
        tracing::info!(stage = %Stage::Extract, ?cursor, "extracting");
        let extractor = Extractor::new(self.source.as_ref(), self.page_size, self.policy);
        let extraction = extractor
            .extract(cursor, request.range, cancel)
            .await
            .map_err(|err| match err {
                ExtractionError::Cancelled { .. } => (
                    Stage::Extract,
                    PipelineError::Cancelled {
                        stage: Stage::Extract.as_str(),
                    },
                ),
                other => (Stage::Extract, PipelineError::Extraction(other)),
            })?;

        if extraction.is_empty() {
            tracing::info!("no new data");
            return Ok((RunReport::new(run_id, RunOutcome::NoData, "no new data"), None));
        }
        let batch_max = extraction.max_id;
        let undecodable = extraction.malformed.len();
        tracing::info!(
            pages = extraction.pages,
            records = extraction.records.len(),
            malformed = undecodable,
            ?batch_max,
            "extraction complete"
        );

        checkpoint(cancel, Stage::Transform)?;
        tracing::info!(stage = %Stage::Transform, "classifying and aggregating");
        let transformed = self.transform(extraction.records).await?;
        let Transformed {
            batch,
            cells,
            devices,
            summary,
        } = transformed;
        tracing::info!(
            classified = batch.records.len(),
            filtered = batch.filtered,
            malformed = batch.malformed,
            grid_cells = cells.len(),
            devices = devices.len(),
            "transform complete"
        );

        checkpoint(cancel, Stage::Load)?;
        let mode = if request.force_refresh {
            LoadMode::Overwrite
        } else {
            LoadMode::Append
        };
        tracing::info!(stage = %Stage::Load, ?mode, "loading");
        let load_err = |err| (Stage::Load, PipelineError::Load(err));
        let inserted = self
            .store
            .upsert_records(&batch.records, mode)
            .await
            .map_err(load_err)?;
        self.store
            .replace_grid_cells(run_id, &cells)
            .await
            .map_err(load_err)?;
        self.store
            .replace_device_stats(run_id, &devices)
            .await
            .map_err(load_err)?;

        checkpoint(cancel, Stage::AssignRegions)?;
        tracing::info!(stage = %Stage::AssignRegions, "assigning regions");
        let regions_assigned = match self.assign_regions(request.force_refresh).await {
            Ok(assigned) => assigned,
            Err(err) => {
                tracing::warn!(error = %err, "region assignment incomplete, rows left unassigned");
                0
            }
        };

        checkpoint(cancel, Stage::RecordLedger)?;
        let processed = batch.records.len();
        let mut report = RunReport::new(
            run_id,
            RunOutcome::Success,
            format!("processed {processed} records"),
        );
        report.records_processed = processed;
        report.records_inserted = inserted;
        report.records_filtered = batch.filtered;
        report.records_malformed = batch.malformed + undecodable;
        report.grid_cells = cells.len();
        report.devices = devices.len();
        report.regions_assigned = regions_assigned;
        report.statistics = Some(summary);
        Ok((report, batch_max))
    }

    async fn transform(&self, records: Vec<crate::models::RawRecord>) -> StageResult<Transformed> {
        let cell_size = self.settings.cell_size;
        let partition_size = self.settings.partition_size;
        tokio::task::spawn_blocking(move || {
            let batch = classify_batch(records, cell_size, partition_size);
            let cells = grid::aggregate(&batch.records, cell_size);
            let devices = aggregate_by_device(&batch.records);
            let summary = summarize(&batch.records);
            Transformed {
                batch,
                cells,
                devices,
                summary,
            }
        })
        .await
        .map_err(|err| (Stage::Transform, PipelineError::Transform(err.to_string())))
    }

    /// Fills missing district/province ids across every stored point. With `force`
    /// all existing assignments are cleared first.
    async fn assign_regions(&self, force: bool) -> Result<usize, AssignmentError> {
        let mut records = self.store.load_regions(RegionKind::District).await?;
        records.extend(self.store.load_regions(RegionKind::Province).await?);
        let (regions, rejected) = RegionSet::from_records(records);
        for err in &rejected {
            tracing::warn!(error = %err, "skipping region");
        }
        if regions.is_empty() {
            tracing::info!("no regions loaded, skipping assignment");
            return Ok(0);
        }
        tracing::info!(
            districts = regions.districts.len(),
            provinces = regions.provinces.len(),
            "region indexes built"
        );

        if force {
            let cleared = self.store.clear_assignments().await?;
            tracing::info!(cleared, "cleared existing region assignments");
        }

        let batch_size = self.settings.assign_batch_size;
        let mut after_id = i64::MIN;
        let mut assigned = 0;
        loop {
            let targets = self
                .store
                .pending_assignments(after_id, batch_size as i64)
                .await?;
            let Some(last) = targets.last() else {
                break;
            };
            after_id = last.id;

            let (updates, stats) = regions.assign(&targets);
            let written = self.store.apply_assignments(&updates).await?;
            tracing::debug!(
                examined = stats.examined,
                districts = stats.districts_assigned,
                provinces = stats.provinces_assigned,
                written,
                "assignment batch"
            );
            assigned += updates.len();

            if targets.len() < batch_size {
                break;
            }
        }
        Ok(assigned)
    }

    async fn record_success(
        &self,
        started_at: DateTime<Utc>,
        prior: Option<i64>,
        batch_max: Option<i64>,
        mut report: RunReport,
    ) -> RunReport {
        let run_id = report.run_id;
        let cursor = next_cursor(prior, batch_max);
        let entry =
            LedgerEntry::success(run_id, started_at, cursor, report.records_processed as i64);
        if let Err(err) = self.store.append_ledger(&entry).await {
            return self
                .record_failure(run_id, started_at, prior, Stage::RecordLedger, PipelineError::Ledger(err))
                .await;
        }
        report.last_id = cursor;
        report
    }

    async fn record_failure(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        prior: Option<i64>,
        stage: Stage,
        err: PipelineError,
    ) -> RunReport {
        let message = format!("{stage} failed: {err}");
        tracing::error!(%stage, error = %err, "run failed");
        let entry = LedgerEntry::failed(run_id, started_at, prior, message.clone());
        if let Err(ledger_err) = self.store.append_ledger(&entry).await {
            tracing::error!(error = %ledger_err, "could not record failed run");
        }
        let mut report = RunReport::new(run_id, RunOutcome::Failed, message);
        report.last_id = prior;
        report
    }
}

fn checkpoint(cancel: &CancellationToken, next: Stage) -> StageResult<()> {
    if cancel.is_cancelled() {
        return Err((
            next,
            PipelineError::Cancelled {
                stage: next.as_str(),
            },
        ));
    }
    Ok(())
}

fn elapsed_secs(clock: Instant) -> f64 {
    round_to(clock.elapsed().as_secs_f64(), 2)
}
