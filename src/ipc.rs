//! Line-delimited JSON protocol for driving the runner from a GUI process.
//!
//! Requests arrive one per line on stdin; every job event goes out one per line on
//! stdout (see `JobEvent`'s serde form).

use crate::model::JobDescriptor;
use crate::orchestrator::ControlCommand;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Submit { jobs: Vec<JobDescriptor> },
    Stop { job_id: String },
    StopAll,
    Drain,
    Quit,
}

impl From<Request> for ControlCommand {
    fn from(req: Request) -> Self {
        match req {
            Request::Submit { jobs } => ControlCommand::Submit(jobs),
            Request::Stop { job_id } => ControlCommand::Stop(job_id),
            Request::StopAll => ControlCommand::StopAll,
            Request::Drain => ControlCommand::Drain,
            Request::Quit => ControlCommand::Quit,
        }
    }
}

/// Parse one request line. Blank lines are not requests.
pub fn parse_request(line: &str) -> Result<Option<Request>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let req = serde_json::from_str(line).context("malformed request")?;
    Ok(Some(req))
}

/// Feed requests from `reader` to the controller until EOF, then ask it to quit.
///
/// Returns early if the controller has gone away.
pub async fn forward_requests<R>(reader: R, cmd_tx: UnboundedSender<ControlCommand>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("read request")? {
        match parse_request(&line) {
            Ok(Some(req)) => {
                tracing::debug!(?req, "request");
                if cmd_tx.send(req.into()).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "ignoring request line"),
        }
    }
    // The parent closed our stdin: treat it like the app quitting.
    let _ = cmd_tx.send(ControlCommand::Quit);
    Ok(())
}
