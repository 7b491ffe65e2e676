//! Text summary builder for CLI output.
//!
//! This module computes batch metrics and formats human-readable lines for text mode.

use crate::metrics;
use crate::model::JobStatus;
use crate::state::JobBoard;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_secs(ms: f64) -> String {
    format!("{:.1}s", ms / 1000.0)
}

/// Build a text summary from the final board.
pub(crate) fn build_text_summary(board: &JobBoard) -> TextSummary {
    let mut lines = Vec::new();
    let counts = board.counts();
    lines.push(format!(
        "Jobs: {} total, {} completed, {} failed, {} stopped",
        board.rows().len(),
        counts.completed,
        counts.failed,
        counts.stopped
    ));
    if counts.idle + counts.active > 0 {
        lines.push(format!(
            "Unfinished: {} never started, {} still running",
            counts.idle, counts.active
        ));
    }

    let durations: Vec<f64> = board
        .rows()
        .iter()
        .filter(|r| r.status == JobStatus::Completed)
        .filter_map(|r| r.elapsed_ms.map(|ms| ms as f64))
        .collect();
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&durations) {
        lines.push(format!(
            "Duration (completed): avg {} med {} p25 {} p75 {}",
            fmt_secs(mean),
            fmt_secs(median),
            fmt_secs(p25),
            fmt_secs(p75)
        ));
    }

    for row in board.rows() {
        let mut line = format!("  {:<24} {:<9}", row.id, row.status.label());
        if row.total > 0 {
            line.push_str(&format!(" {}/{} msgs", row.current, row.total));
        }
        if let Some(ms) = row.elapsed_ms {
            line.push_str(&format!(" in {}", fmt_secs(ms as f64)));
        }
        if let Some(reason) = row.reason.as_deref() {
            line.push_str(&format!(" - {reason}"));
        }
        lines.push(line);
        if let Some(log) = row.log_file.as_deref() {
            if row.status == JobStatus::Failed {
                lines.push(format!("      log: {}", log.display()));
            }
        }
    }

    TextSummary { lines }
}
