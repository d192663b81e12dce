use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::{BeginOutcome, LedgerEntry};
use crate::models::{
    Assignment, AssignmentTarget, ClassifiedRecord, DeviceStats, GridCell, LoadMode, RegionKind,
    RegionRecord,
};

/// Destination store used by the pipeline. `PgStore` is the production implementation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Closes RUNNING rows older than `lease`, then either appends a RUNNING row for
    /// `run_id` or reports the run that still holds the ledger. Atomic.
    async fn begin_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<BeginOutcome, StoreError>;

    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    async fn last_success(&self) -> Result<Option<LedgerEntry>, StoreError>;

    /// Most recent rows first.
    async fn recent_ledger(&self, limit: i64) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Upserts on the record id without touching stored region ids. In overwrite mode
    /// the rows for these ids are deleted first, in the same transaction.
    async fn upsert_records(
        &self,
        records: &[ClassifiedRecord],
        mode: LoadMode,
    ) -> Result<u64, StoreError>;

    async fn replace_grid_cells(&self, run_id: Uuid, cells: &[GridCell]) -> Result<u64, StoreError>;

    async fn replace_device_stats(
        &self,
        run_id: Uuid,
        stats: &[DeviceStats],
    ) -> Result<u64, StoreError>;

    /// Regions of one kind in ascending id order.
    async fn load_regions(&self, kind: RegionKind) -> Result<Vec<RegionRecord>, StoreError>;

    async fn clear_assignments(&self) -> Result<u64, StoreError>;

    /// Stored points missing either region id with `id > after_id`, ascending.
    async fn pending_assignments(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AssignmentTarget>, StoreError>;

    /// Fills only the columns that are still NULL. Returns the number of fields written.
    async fn apply_assignments(&self, updates: &[Assignment]) -> Result<u64, StoreError>;
}
