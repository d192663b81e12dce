use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// One append-only ledger row. A run writes a RUNNING row and later a terminal row with the same `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub status: RunStatus,
    /// `None` until some run has processed a record.
    pub last_processed_id: Option<i64>,
    pub records_processed: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl LedgerEntry {
    pub fn running(run_id: Uuid, started_at: DateTime<Utc>, cursor: Option<i64>) -> Self {
        Self {
            run_id,
            started_at,
            recorded_at: started_at,
            status: RunStatus::Running,
            last_processed_id: cursor,
            records_processed: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn success(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cursor: Option<i64>,
        records_processed: i64,
    ) -> Self {
        let recorded_at = Utc::now();
        Self {
            run_id,
            started_at,
            recorded_at,
            status: RunStatus::Success,
            last_processed_id: cursor,
            records_processed,
            duration_ms: elapsed_ms(started_at, recorded_at),
            error: None,
        }
    }

    /// A FAILED row carries the cursor the run started from, so it never moves resumption forward.
    pub fn failed(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cursor: Option<i64>,
        error: impl Into<String>,
    ) -> Self {
        let recorded_at = Utc::now();
        Self {
            run_id,
            started_at,
            recorded_at,
            status: RunStatus::Failed,
            last_processed_id: cursor,
            records_processed: 0,
            duration_ms: elapsed_ms(started_at, recorded_at),
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// A RUNNING row older than `lease` belongs to a run that died without closing it.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status == RunStatus::Running && now - self.started_at > lease
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

/// Result of asking the ledger for permission to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The RUNNING row was written; `cursor` is the resume point (`None` when starting from scratch).
    Acquired { cursor: Option<i64> },
    /// Another run holds the ledger.
    Busy { run_id: Uuid },
}

/// Cursor written by a successful run. Never moves backwards, and stays `None`
/// until a batch has actually been seen.
pub fn next_cursor(prior: Option<i64>, batch_max: Option<i64>) -> Option<i64> {
    prior.into_iter().chain(batch_max).max()
}

/// Resume cursor: `last_processed_id` of the most recent SUCCESS row.
/// `PgStore` answers the same question in SQL.
#[cfg(test)]
pub fn resume_cursor(entries: &[LedgerEntry]) -> Option<i64> {
    entries
        .iter()
        .filter(|e| e.status == RunStatus::Success)
        .max_by_key(|e| e.recorded_at)
        .and_then(|e| e.last_processed_id)
}

/// RUNNING rows with no terminal row for the same run.
pub fn active_runs(entries: &[LedgerEntry]) -> Vec<&LedgerEntry> {
    entries
        .iter()
        .filter(|e| e.status == RunStatus::Running)
        .filter(|running| {
            !entries
                .iter()
                .any(|e| e.run_id == running.run_id && e.is_terminal())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(minutes_ago)
    }

    #[test]
    fn cursor_never_decreases() {
        assert_eq!(next_cursor(None, None), None);
        assert_eq!(next_cursor(None, Some(-3)), Some(-3));
        assert_eq!(next_cursor(None, Some(12)), Some(12));
        assert_eq!(next_cursor(Some(50), Some(12)), Some(50));
        assert_eq!(next_cursor(Some(50), Some(51)), Some(51));
        assert_eq!(next_cursor(Some(50), None), Some(50));
    }

    #[test]
    fn resume_cursor_ignores_failed_rows() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut ok = LedgerEntry::success(first, at(30), Some(120), 20);
        ok.recorded_at = at(29);
        let mut bad = LedgerEntry::failed(second, at(10), Some(120), "boom");
        bad.recorded_at = at(9);
        bad.last_processed_id = Some(999);
        let entries = vec![LedgerEntry::running(first, at(30), Some(100)), ok, bad];
        assert_eq!(resume_cursor(&entries), Some(120));
        assert_eq!(resume_cursor(&[]), None);
    }

    #[test]
    fn active_means_running_without_terminal_row() {
        let done = Uuid::new_v4();
        let live = Uuid::new_v4();
        let entries = vec![
            LedgerEntry::running(done, at(20), None),
            LedgerEntry::success(done, at(20), Some(10), 10),
            LedgerEntry::running(live, at(5), Some(10)),
        ];
        let active = active_runs(&entries);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, live);
    }

    #[test]
    fn lease_expiry() {
        let stale = LedgerEntry::running(Uuid::new_v4(), at(180), None);
        let fresh = LedgerEntry::running(Uuid::new_v4(), at(5), None);
        let lease = Duration::minutes(120);
        assert!(stale.lease_expired(Utc::now(), lease));
        assert!(!fresh.lease_expired(Utc::now(), lease));
        let closed = LedgerEntry::failed(stale.run_id, at(180), None, "lease expired");
        assert!(!closed.lease_expired(Utc::now(), lease));
    }

    #[test]
    fn status_text_round_trips() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("DONE".parse::<RunStatus>().is_err());
    }
}
