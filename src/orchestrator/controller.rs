//! Job lifecycle controller.
//!
//! Owns batch submission, cancellation and shutdown. Presentation layers talk to it
//! through [`ControlCommand`]s and watch the job event channel for results.

use super::pool::Pool;
use crate::engine::{JobRunner, Termination};
use crate::error::StopReason;
use crate::model::JobDescriptor;
use anyhow::Result;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Commands emitted by UI layers to control jobs.
#[derive(Debug, Clone)]
pub(crate) enum ControlCommand {
    Submit(Vec<JobDescriptor>),
    Stop(String),
    /// Stop running jobs and cancel everything submitted so far.
    StopAll,
    /// Finish submitted work, then exit.
    Drain,
    Quit,
}

/// Spawn a batch onto the shared pool. Jobs remember the stop-all generation
/// current at submission.
fn start_batch(
    runner: &Arc<JobRunner>,
    pool: &Pool,
    jobs: Vec<JobDescriptor>,
) -> JoinHandle<Vec<Termination>> {
    let runner = runner.clone();
    let pool = pool.clone();
    let generation = runner.registry().generation();
    tracing::info!(jobs = jobs.len(), generation, "starting batch");
    tokio::spawn(async move {
        pool.run_all(jobs, move |descriptor| {
            let runner = runner.clone();
            async move { runner.run(descriptor, generation).await }
        })
        .await
    })
}

fn log_batch(results: &[Termination]) {
    let completed = results.iter().filter(|t| t.is_completed()).count();
    let failed = results
        .iter()
        .filter(|t| matches!(t, Termination::Failed(_)))
        .count();
    let stopped = results.len() - completed - failed;
    tracing::info!(completed, failed, stopped, "batch finished");
}

/// Process control commands until drained or told to quit.
///
/// Every submission starts at once and competes for the same pool slots, so the
/// concurrency ceiling holds across submissions without one batch waiting on another.
pub(crate) async fn run_controller(
    runner: Arc<JobRunner>,
    concurrency: usize,
    shutdown_timeout: Duration,
    mut cmd_rx: UnboundedReceiver<ControlCommand>,
) -> Result<()> {
    let pool = Pool::new(concurrency)?;

    let mut batches: FuturesUnordered<JoinHandle<Vec<Termination>>> = FuturesUnordered::new();
    let mut draining = false;
    let mut quit_pending = false;
    // Shutdown watchdog: if jobs take too long to die, say so in the log.
    let mut shutdown_deadline: Option<Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        if batches.is_empty() && (quit_pending || draining) {
            break;
        }

        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(ControlCommand::Submit(jobs)) => {
                        let jobs = runner.registry().claim(jobs);
                        if draining {
                            tracing::warn!(jobs = jobs.len(), "submit after drain, skipping");
                            for descriptor in jobs {
                                runner.skip(descriptor, StopReason::Shutdown);
                            }
                        } else if !jobs.is_empty() {
                            batches.push(start_batch(&runner, &pool, jobs));
                        }
                    }
                    Some(ControlCommand::Stop(job_id)) => {
                        if !runner.stop(&job_id) {
                            tracing::debug!(job_id = %job_id, "nothing to stop");
                        }
                    }
                    Some(ControlCommand::StopAll) => {
                        let signalled = runner.registry().stop_all(StopReason::User);
                        tracing::info!(signalled, "stopping all jobs");
                    }
                    Some(ControlCommand::Drain) => {
                        draining = true;
                    }
                    Some(ControlCommand::Quit) | None => {
                        // Quit still waits for running jobs to report their stop;
                        // jobs waiting for a slot are refused when they get one.
                        quit_pending = true;
                        let signalled = runner.registry().shutdown();
                        tracing::info!(signalled, "shutting down");
                        if !batches.is_empty() {
                            shutdown_deadline = Some(Instant::now() + shutdown_timeout);
                        }
                    }
                }
            }
            Some(joined) = batches.next(), if !batches.is_empty() => {
                match joined {
                    Ok(results) => log_batch(&results),
                    Err(e) => tracing::error!(error = %e, "batch task failed"),
                }
                if batches.is_empty() {
                    shutdown_deadline = None;
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = shutdown_deadline {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            jobs = ?runner.registry().job_ids(),
                            "still waiting for jobs to stop"
                        );
                        shutdown_deadline = None;
                    }
                }
            }
        }
    }

    Ok(())
}
