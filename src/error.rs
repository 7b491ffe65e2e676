//! Per-job error and stop taxonomy.
//!
//! None of these ever escape the pool: the runner turns each into the job's own
//! `Failed` or `Stopped` event.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("imapsync binary not found or not accessible: {}", path.display())]
    BinaryNotFound { path: PathBuf },

    #[error("failed to prepare log directory {}: {source}", path.display())]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch imapsync: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("imapsync exited with code {code}{}", detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    ProcessExit { code: i32, detail: Option<String> },

    #[error("error while waiting for imapsync: {0}")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("job {0} is already running")]
    AlreadyRunning(String),
    #[error("shutting down, no new jobs accepted")]
    ShuttingDown,
    #[error("job was cancelled before it started")]
    Cancelled,
}

/// Why a job ended without completing. Never presented as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    Shutdown,
    /// The process died from a signal nobody here sent.
    Signal,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::User => f.write_str("stopped by user"),
            StopReason::Shutdown => f.write_str("stopped by shutdown"),
            StopReason::Signal => f.write_str("terminated by signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_embeds_code_and_detail() {
        let e = JobError::ProcessExit {
            code: 16,
            detail: Some("Host1 failure: Error login".into()),
        };
        assert_eq!(
            e.to_string(),
            "imapsync exited with code 16: Host1 failure: Error login"
        );

        let e = JobError::ProcessExit {
            code: 1,
            detail: None,
        };
        assert_eq!(e.to_string(), "imapsync exited with code 1");
    }
}
