use crate::engine::{JobRegistry, JobRunner};
use crate::ipc;
use crate::locate;
use crate::model::{Endpoint, JobDescriptor, JobEvent, RunnerConfig};
use crate::orchestrator::{run_controller, ControlCommand};
use crate::state::JobBoard;
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_CONCURRENCY: usize = 3;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "imapsync-runner",
    version,
    about = "Run imapsync mailbox migrations concurrently with live progress"
)]
pub struct Cli {
    /// JSON file with jobs: an array of jobs or {"concurrency": N, "jobs": [...]}
    #[arg(long)]
    pub jobs: Option<PathBuf>,

    /// Id for the job given with --host1/--user1/... flags
    #[arg(long, default_value = "job-1")]
    pub id: String,

    /// Source IMAP host
    #[arg(long)]
    pub host1: Option<String>,

    /// Source user
    #[arg(long)]
    pub user1: Option<String>,

    /// Source password
    #[arg(long, env = "IMAPSYNC_PASSWORD1", hide_env_values = true)]
    pub password1: Option<String>,

    /// Destination IMAP host
    #[arg(long)]
    pub host2: Option<String>,

    /// Destination user
    #[arg(long)]
    pub user2: Option<String>,

    /// Destination password
    #[arg(long, env = "IMAPSYNC_PASSWORD2", hide_env_values = true)]
    pub password2: Option<String>,

    /// Path to the imapsync executable (default: search PATH, then next to this binary)
    #[arg(long, env = "IMAPSYNC_BIN")]
    pub binary: Option<PathBuf>,

    /// Directory for per-job imapsync logs
    #[arg(long, env = "IMAPSYNC_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Maximum number of imapsync processes running at once [default: 3]
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Extra argument passed through to every imapsync run (repeatable)
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,

    /// How long to keep reading output after imapsync has exited
    #[arg(long, default_value = "2s")]
    pub drain_grace: humantime::Duration,

    /// Warn if jobs are still winding down this long after a shutdown request
    #[arg(long, default_value = "5s")]
    pub shutdown_timeout: humantime::Duration,

    /// Stream job events as JSON lines instead of text
    #[arg(long)]
    pub json: bool,

    /// Sidecar mode: read JSON requests on stdin, write JSON events on stdout
    #[arg(long, conflicts_with_all = ["json", "jobs"])]
    pub serve: bool,

    /// Suppress progress output; only the outcome is reported
    #[arg(long)]
    pub silent: bool,
}

/// On-disk job list, either bare or with its own concurrency.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobFile {
    List(Vec<JobDescriptor>),
    Batch {
        #[serde(default)]
        concurrency: Option<usize>,
        jobs: Vec<JobDescriptor>,
    },
}

fn load_job_file(path: &Path) -> Result<(Vec<JobDescriptor>, Option<usize>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read job file {}", path.display()))?;
    let parsed: JobFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse job file {}", path.display()))?;
    Ok(match parsed {
        JobFile::List(jobs) => (jobs, None),
        JobFile::Batch { concurrency, jobs } => (jobs, concurrency),
    })
}

/// The job described by command-line flags, if any were given.
fn single_job(args: &Cli) -> Result<Option<JobDescriptor>> {
    let fields = [
        ("--host1", &args.host1),
        ("--user1", &args.user1),
        ("--password1", &args.password1),
        ("--host2", &args.host2),
        ("--user2", &args.user2),
        ("--password2", &args.password2),
    ];
    // Passwords may come from the environment alone; they do not start a job by themselves.
    if args.host1.is_none() && args.user1.is_none() && args.host2.is_none() && args.user2.is_none() {
        return Ok(None);
    }
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(flag, _)| *flag)
        .collect();
    if !missing.is_empty() {
        bail!("incomplete job: missing {}", missing.join(", "));
    }
    let get = |v: &Option<String>| v.clone().unwrap_or_default();
    Ok(Some(JobDescriptor {
        id: args.id.clone(),
        source: Endpoint {
            host: get(&args.host1),
            user: get(&args.user1),
            password: get(&args.password1),
        },
        destination: Endpoint {
            host: get(&args.host2),
            user: get(&args.user2),
            password: get(&args.password2),
        },
    }))
}

/// Build a `RunnerConfig` from CLI arguments.
pub fn build_config(args: &Cli, file_concurrency: Option<usize>) -> Result<RunnerConfig> {
    let concurrency = args
        .concurrency
        .or(file_concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    ensure!(concurrency >= 1, "--concurrency must be at least 1");
    Ok(RunnerConfig {
        binary: locate::resolve_binary(args.binary.as_deref()),
        log_dir: locate::resolve_log_dir(args.log_dir.as_deref()),
        concurrency,
        extra_args: args.extra_args.clone(),
        drain_grace: Duration::from(args.drain_grace),
        shutdown_timeout: Duration::from(args.shutdown_timeout),
    })
}

/// Returns false when any job failed.
pub async fn run(args: Cli) -> Result<bool> {
    if args.serve {
        return run_serve(args).await;
    }

    let mut jobs = Vec::new();
    let mut file_concurrency = None;
    if let Some(path) = args.jobs.as_deref() {
        let (file_jobs, c) = load_job_file(path)?;
        jobs.extend(file_jobs);
        file_concurrency = c;
    }
    jobs.extend(single_job(&args)?);
    if jobs.is_empty() {
        bail!("no jobs given: use --jobs FILE or --host1/--user1/--password1/--host2/--user2/--password2");
    }

    let cfg = build_config(&args, file_concurrency)?;
    tracing::info!(
        binary = %cfg.binary.display(),
        log_dir = %cfg.log_dir.display(),
        concurrency = cfg.concurrency,
        "configuration"
    );
    run_batch(&args, cfg, jobs).await
}

/// Quit the controller on Ctrl-C.
fn spawn_ctrl_c(cmd_tx: mpsc::UnboundedSender<ControlCommand>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping jobs");
            let _ = cmd_tx.send(ControlCommand::Quit);
        }
    })
}

fn spawn_controller(
    cfg: RunnerConfig,
    event_tx: mpsc::UnboundedSender<JobEvent>,
) -> (
    mpsc::UnboundedSender<ControlCommand>,
    tokio::task::JoinHandle<Result<()>>,
) {
    let concurrency = cfg.concurrency;
    let shutdown_timeout = cfg.shutdown_timeout;
    let runner = Arc::new(JobRunner::new(Arc::new(cfg), JobRegistry::new(), event_tx));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ControlCommand>();
    let handle = tokio::spawn(run_controller(runner, concurrency, shutdown_timeout, cmd_rx));
    (cmd_tx, handle)
}

async fn run_batch(args: &Cli, cfg: RunnerConfig, jobs: Vec<JobDescriptor>) -> Result<bool> {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, controller) = spawn_controller(cfg, evt_tx);
    let ctrl_c = spawn_ctrl_c(cmd_tx.clone());
    let (out_tx, out_handle) = spawn_output_writer();

    let mut board = JobBoard::new();
    board.submit(&jobs);
    let _ = cmd_tx.send(ControlCommand::Submit(jobs));
    let _ = cmd_tx.send(ControlCommand::Drain);

    while let Some(ev) = evt_rx.recv().await {
        board.apply(&ev);
        if args.json {
            let line = serde_json::to_string(&ev)?;
            let _ = out_tx.send(OutputLine::Stdout(line));
            continue;
        }
        if args.silent {
            continue;
        }
        match &ev {
            JobEvent::Output(o) => {
                if o.is_error {
                    for line in o.content.lines().filter(|l| !l.trim().is_empty()) {
                        let _ = out_tx.send(OutputLine::Stderr(format!("[{}] ! {}", o.job_id, line)));
                    }
                }
            }
            other => {
                if let Some(row) = board.get(other.job_id()) {
                    let _ = out_tx.send(OutputLine::Stderr(row.render()));
                }
            }
        }
    }

    controller.await.context("controller task failed")??;
    ctrl_c.abort();
    if !board.all_finished() {
        tracing::warn!("some jobs never reported an outcome");
    }

    if !args.json {
        let summary = crate::text_summary::build_text_summary(&board);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    Ok(board.counts().failed == 0)
}

async fn run_serve(args: Cli) -> Result<bool> {
    let cfg = build_config(&args, None)?;
    tracing::info!(
        binary = %cfg.binary.display(),
        concurrency = cfg.concurrency,
        "serving requests on stdin"
    );
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, controller) = spawn_controller(cfg, evt_tx);
    let ctrl_c = spawn_ctrl_c(cmd_tx.clone());
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let reader = tokio::spawn(ipc::forward_requests(stdin, cmd_tx));
    let (out_tx, out_handle) = spawn_output_writer();

    let mut board = JobBoard::new();
    while let Some(ev) = evt_rx.recv().await {
        board.apply(&ev);
        if ev.is_terminal() {
            tracing::debug!(job_id = %ev.job_id(), "job finished");
        }
        let line = serde_json::to_string(&ev)?;
        let _ = out_tx.send(OutputLine::Stdout(line));
    }

    controller.await.context("controller task failed")??;
    ctrl_c.abort();
    reader.abort();
    drop(out_tx);
    let _ = out_handle.await;

    Ok(board.counts().failed == 0)
}
