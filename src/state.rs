//! Per-job view state built from the event stream.
//!
//! This is what a UI renders: one row per submitted job, updated in place as events
//! arrive. Events that would move a row out of a terminal state are dropped.

use crate::model::{JobDescriptor, JobEvent, JobStatus};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub status: JobStatus,
    pub percent: u8,
    pub current: u64,
    pub total: u64,
    pub message: String,
    pub last_output: Option<String>,
    pub reason: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub log_file: Option<PathBuf>,
}

impl JobRow {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Idle,
            percent: 0,
            current: 0,
            total: 0,
            message: String::new(),
            last_output: None,
            reason: None,
            elapsed_ms: None,
            log_file: None,
        }
    }

    /// One-line rendering for text mode.
    pub fn render(&self) -> String {
        let mut line = format!("[{}] {:<9} {:>3}%", self.id, self.status.label(), self.percent);
        if !self.message.is_empty() {
            line.push_str("  ");
            line.push_str(&self.message);
        }
        if let Some(reason) = &self.reason {
            line.push_str(&format!("  ({reason})"));
        }
        line
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub idle: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

#[derive(Debug, Default)]
pub struct JobBoard {
    rows: Vec<JobRow>,
    index: HashMap<String, usize>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rows for newly submitted jobs. A finished row with the same id is reset.
    pub fn submit(&mut self, jobs: &[JobDescriptor]) {
        for job in jobs {
            let row = self.row_mut(&job.id);
            if row.status.is_terminal() {
                *row = JobRow::new(&job.id);
            }
        }
    }

    fn row_mut(&mut self, id: &str) -> &mut JobRow {
        let idx = match self.index.get(id) {
            Some(&idx) => idx,
            None => {
                self.rows.push(JobRow::new(id));
                self.index.insert(id.to_string(), self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        &mut self.rows[idx]
    }

    /// Fold one event into the board. Returns false if the event was ignored.
    pub fn apply(&mut self, event: &JobEvent) -> bool {
        let row = self.row_mut(event.job_id());
        if row.status.is_terminal() {
            return false;
        }
        match event {
            JobEvent::Started { log_file, .. } => {
                if row.status == JobStatus::Idle {
                    row.status = JobStatus::Starting;
                }
                if !row.status.can_transition_to(JobStatus::Running) {
                    return false;
                }
                row.status = JobStatus::Running;
                row.log_file = Some(log_file.clone());
            }
            JobEvent::Progress(p) => {
                row.current = p.current;
                row.total = p.total;
                row.percent = p.percent;
                row.message = p.message.clone();
            }
            JobEvent::Output(o) => {
                if let Some(line) = o.content.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                    row.last_output = Some(line.to_string());
                }
            }
            JobEvent::Completed { elapsed_ms, .. } => {
                if !row.status.can_transition_to(JobStatus::Completed) {
                    return false;
                }
                row.status = JobStatus::Completed;
                row.percent = 100;
                row.elapsed_ms = Some(*elapsed_ms);
            }
            JobEvent::Failed {
                reason, elapsed_ms, ..
            } => {
                row.status = JobStatus::Failed;
                row.reason = Some(reason.clone());
                row.elapsed_ms = Some(*elapsed_ms);
            }
            JobEvent::Stopped {
                reason, elapsed_ms, ..
            } => {
                row.status = JobStatus::Stopped;
                row.reason = Some(reason.clone());
                row.elapsed_ms = Some(*elapsed_ms);
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&JobRow> {
        self.index.get(id).map(|&idx| &self.rows[idx])
    }

    pub fn rows(&self) -> &[JobRow] {
        &self.rows
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for row in &self.rows {
            match row.status {
                JobStatus::Idle => counts.idle += 1,
                JobStatus::Starting | JobStatus::Running => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    pub fn all_finished(&self) -> bool {
        self.rows.iter().all(|r| r.status.is_terminal())
    }
}
