use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

/// Resolved inputs for running jobs. Built once by the CLI layer.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: PathBuf,
    pub log_dir: PathBuf,
    pub concurrency: usize,
    /// Appended verbatim after the generated arguments (e.g. `--ssl1`).
    pub extra_args: Vec<String>,
    /// How long to keep reading output after the process has exited.
    pub drain_grace: Duration,
    pub shutdown_timeout: Duration,
}

/// One side of a migration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub user: String,
    #[serde(alias = "secret")]
    pub password: String,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub source: Endpoint,
    pub destination: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub current: u64,
    pub total: u64,
    pub message: String,
    /// Integer percentage in 0..=100.
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub job_id: String,
    /// Raw chunk as read from the stream; not aligned to line boundaries.
    pub content: String,
    /// True when the chunk came from stderr.
    pub is_error: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything a job reports to its subscriber, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: String,
        log_file: PathBuf,
    },
    Progress(ProgressEvent),
    Output(OutputEvent),
    Completed {
        job_id: String,
        elapsed_ms: u64,
    },
    Failed {
        job_id: String,
        reason: String,
        elapsed_ms: u64,
    },
    Stopped {
        job_id: String,
        reason: String,
        elapsed_ms: u64,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Stopped { job_id, .. } => job_id,
            JobEvent::Progress(p) => &p.job_id,
            JobEvent::Output(o) => &o.job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Stopped { .. }
        )
    }
}

/// Lifecycle of a single job.
///
/// `Idle -> Starting -> Running -> {Completed | Failed | Stopped}`. A job may also fail
/// or be stopped before it ever reaches `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Running) => true,
            (Running, Completed) => true,
            (Idle | Starting | Running, Failed | Stopped) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_debug_hides_password() {
        let ep = Endpoint {
            host: "imap.example.com".into(),
            user: "alice".into(),
            password: "hunter2".into(),
        };
        let dbg = format!("{ep:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn descriptor_accepts_secret_alias() {
        let json = r#"{
            "id": "a",
            "source": {"host": "h1", "user": "u1", "secret": "p"},
            "destination": {"host": "h2", "user": "u2", "password": "p"}
        }"#;
        let d: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.source.password, "p");
        assert_eq!(d.destination.user, "u2");
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let ev = JobEvent::Completed {
            job_id: "a".into(),
            elapsed_ms: 12,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "completed");
        assert_eq!(v["job_id"], "a");

        let ev = JobEvent::Progress(ProgressEvent {
            job_id: "b".into(),
            current: 1,
            total: 2,
            message: "x".into(),
            percent: 50,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "progress");
        assert_eq!(v["percent"], 50);
    }

    #[test]
    fn terminal_states_are_final() {
        for t in [JobStatus::Completed, JobStatus::Failed, JobStatus::Stopped] {
            for next in [
                JobStatus::Idle,
                JobStatus::Starting,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Stopped,
            ] {
                assert!(!t.can_transition_to(next), "{t:?} -> {next:?}");
            }
        }
        assert!(JobStatus::Idle.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Idle.can_transition_to(JobStatus::Completed));
    }
}
