use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::ledger::{LedgerEntry, RunStatus};

/// Terminal rows only; RUNNING rows are listed separately as in-flight.
fn completed(entries: &[LedgerEntry]) -> impl Iterator<Item = &LedgerEntry> {
    entries.iter().filter(|e| e.is_terminal())
}

fn cursor_text(cursor: Option<i64>) -> String {
    cursor.map_or_else(|| "-".to_string(), |id| id.to_string())
}

pub fn build_history(
    generated_at: DateTime<Utc>,
    last_success: Option<&LedgerEntry>,
    entries: &[LedgerEntry],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Telemetry ETL Run History");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Resume Cursor");

    match last_success {
        Some(entry) => {
            let _ = writeln!(
                output,
                "- last processed id {} (run {} at {})",
                cursor_text(entry.last_processed_id),
                entry.run_id,
                entry.recorded_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        None => {
            let _ = writeln!(output, "No successful run yet; the next run starts from the beginning.");
        }
    }

    let in_flight: Vec<&LedgerEntry> = crate::ledger::active_runs(entries);
    if !in_flight.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## In Flight");
        for entry in &in_flight {
            let _ = writeln!(
                output,
                "- run {} started {}",
                entry.run_id,
                entry.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Runs");
    let _ = writeln!(output, "| Recorded | Status | Cursor | Records | Duration |");
    let _ = writeln!(output, "|---|---|---|---|---|");

    let mut runs = 0;
    for entry in completed(entries) {
        runs += 1;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {:.2}s |",
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status,
            cursor_text(entry.last_processed_id),
            entry.records_processed,
            entry.duration_ms as f64 / 1000.0
        );
    }
    if runs == 0 {
        let _ = writeln!(output, "| - | no completed runs | - | - | - |");
    }

    let failures: Vec<&LedgerEntry> = completed(entries)
        .filter(|e| e.status == RunStatus::Failed)
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Failures");

    if failures.is_empty() {
        let _ = writeln!(output, "No failed runs in this window.");
    } else {
        for entry in failures.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} run {}: {}",
                entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                entry.run_id,
                entry.error.as_deref().unwrap_or("no message recorded")
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn empty_history_says_so() {
        let report = build_history(Utc::now(), None, &[]);
        assert!(report.contains("No successful run yet"));
        assert!(report.contains("no completed runs"));
        assert!(report.contains("No failed runs"));
        assert!(!report.contains("In Flight"));
    }

    #[test]
    fn lists_runs_and_failures() {
        let ok_run = Uuid::new_v4();
        let bad_run = Uuid::new_v4();
        let live_run = Uuid::new_v4();
        let started = Utc::now();
        let success = LedgerEntry::success(ok_run, started, Some(1400), 1398);
        let entries = vec![
            LedgerEntry::running(live_run, started, Some(1400)),
            LedgerEntry::failed(
                bad_run,
                started,
                Some(1400),
                "EXTRACT failed: origin rejected request with 401",
            ),
            success.clone(),
            LedgerEntry::running(ok_run, started, None),
        ];

        let report = build_history(Utc::now(), Some(&success), &entries);
        assert!(report.contains("last processed id 1400"));
        assert!(report.contains("## In Flight"));
        assert!(report.contains(&live_run.to_string()));
        assert!(report.contains("| SUCCESS | 1400 | 1398 |"));
        assert!(report.contains("| FAILED | 1400 | 0 |"));
        assert!(report.contains("origin rejected request with 401"));
    }

    #[test]
    fn empty_first_run_shows_no_cursor() {
        let run = Uuid::new_v4();
        let success = LedgerEntry::success(run, Utc::now(), None, 0);
        let report = build_history(Utc::now(), Some(&success), &[success.clone()]);
        assert!(report.contains("last processed id -"));
        assert!(report.contains("| SUCCESS | - | 0 |"));
    }
}
