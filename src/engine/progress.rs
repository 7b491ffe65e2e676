//! Turns imapsync's free-form stdout into progress events.
//!
//! Classification is a single pass over an ordered rule table; the first rule whose
//! pattern matches decides what the line means. Applying the result to the running
//! totals is kept separate so both halves can be tested on their own.

use crate::metrics::percent;
use crate::model::ProgressEvent;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// What a recognised line says, before it touches any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Folder(String),
    FolderCount(u64),
    MessageCount(u64),
    Countdown { remaining: u64, total: u64 },
    Connecting(Side),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

type Build = fn(&Captures<'_>) -> Option<Marker>;

/// Evaluated top to bottom.
const RULES: &[(&str, Build)] = &[
    (r"Host\d: Folder \[(?P<name>[^\]]*)\]", |c| {
        Some(Marker::Folder(c["name"].to_string()))
    }),
    (r"Host1 Nb folders:\s*(?P<n>\d+)\s+folders", |c| {
        c["n"].parse().ok().map(Marker::FolderCount)
    }),
    (r"Host1 Nb messages:\s*(?P<n>\d+)\s+messages", |c| {
        c["n"].parse().ok().map(Marker::MessageCount)
    }),
    (r"(?P<left>\d+)/(?P<total>\d+) msgs left", |c| {
        Some(Marker::Countdown {
            remaining: c["left"].parse().ok()?,
            total: c["total"].parse().ok()?,
        })
    }),
    (r"(?i)Connection on host(?P<side>[12])", |c| {
        Some(Marker::Connecting(if &c["side"] == "1" {
            Side::Source
        } else {
            Side::Destination
        }))
    }),
    (r"Transfer ended", |_| Some(Marker::Done)),
];

static COMPILED: LazyLock<Vec<(Regex, Build)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(pattern, build)| (Regex::new(pattern).expect("valid progress pattern"), *build))
        .collect()
});

/// Classify a single line. Lines no rule recognises, or whose numbers do not fit,
/// return `None`.
pub fn classify(line: &str) -> Option<Marker> {
    COMPILED
        .iter()
        .find_map(|(re, build)| re.captures(line).map(|c| build(&c)))
        .flatten()
}

/// Running parse state for one job.
#[derive(Debug)]
pub struct ProgressExtractor {
    job_id: String,
    total_messages: u64,
    completed_messages: u64,
    current_folder: String,
}

impl ProgressExtractor {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            total_messages: 0,
            completed_messages: 0,
            current_folder: String::new(),
        }
    }

    #[cfg(test)]
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    #[cfg(test)]
    pub fn completed_messages(&self) -> u64 {
        self.completed_messages
    }

    #[cfg(test)]
    pub fn current_folder(&self) -> &str {
        &self.current_folder
    }

    /// Inspect one stdout line; at most one event comes out of it.
    pub fn observe(&mut self, line: &str) -> Option<ProgressEvent> {
        let marker = classify(line)?;
        self.apply(marker)
    }

    fn apply(&mut self, marker: Marker) -> Option<ProgressEvent> {
        match marker {
            Marker::Folder(name) => {
                let message = format!("Processing folder: {name}");
                self.current_folder = name;
                Some(self.event(
                    self.completed_messages,
                    self.total_messages,
                    message,
                    percent(self.completed_messages, self.total_messages),
                ))
            }
            Marker::FolderCount(n) => {
                Some(self.event(0, n, format!("Found {n} folders to process"), 0))
            }
            Marker::MessageCount(n) => {
                self.total_messages = n;
                Some(self.event(0, n, format!("Found {n} messages to transfer"), 0))
            }
            Marker::Countdown { total: 0, .. } => None,
            Marker::Countdown { remaining, total } => {
                self.completed_messages = total.saturating_sub(remaining);
                self.total_messages = total;
                let message = if self.current_folder.is_empty() {
                    format!("Transferred {} of {} messages", self.completed_messages, total)
                } else {
                    format!(
                        "Transferring {}: {} of {} messages",
                        self.current_folder, self.completed_messages, total
                    )
                };
                Some(self.event(
                    self.completed_messages,
                    total,
                    message,
                    percent(self.completed_messages, total),
                ))
            }
            Marker::Connecting(side) => {
                let message = match side {
                    Side::Source => "Connecting to source server (host1)",
                    Side::Destination => "Connecting to destination server (host2)",
                };
                Some(self.event(
                    self.completed_messages,
                    self.total_messages,
                    message.to_string(),
                    0,
                ))
            }
            Marker::Done => Some(self.event(
                self.total_messages,
                self.total_messages,
                "Transfer complete".to_string(),
                100,
            )),
        }
    }

    fn event(&self, current: u64, total: u64, message: String, percent: u8) -> ProgressEvent {
        ProgressEvent {
            job_id: self.job_id.clone(),
            current,
            total,
            message,
            percent,
        }
    }
}
