//! Drives one imapsync process from spawn to its single terminal event.

use super::command;
use super::lines::{LineSplitter, Utf8Chunk};
use super::progress::ProgressExtractor;
use super::registry::{JobControl, JobRegistry};
use crate::error::{JobError, RegisterError, StopReason};
use crate::model::{JobDescriptor, JobEvent, OutputEvent, RunnerConfig};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

const READ_CHUNK: usize = 8 * 1024;

/// How a job ended. The same outcome is also reported as the job's terminal event.
#[derive(Debug)]
pub enum Termination {
    Completed,
    Failed(JobError),
    Stopped(StopReason),
}

impl Termination {
    pub fn is_completed(&self) -> bool {
        matches!(self, Termination::Completed)
    }
}

pub struct JobRunner {
    config: Arc<RunnerConfig>,
    registry: JobRegistry,
    events: UnboundedSender<JobEvent>,
}

impl JobRunner {
    pub fn new(
        config: Arc<RunnerConfig>,
        registry: JobRegistry,
        events: UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Ask a running job to stop. Unknown or finished ids are ignored.
    pub fn stop(&self, job_id: &str) -> bool {
        self.registry.stop(job_id, StopReason::User)
    }

    /// Close out a job that will never be started, e.g. one still queued at shutdown.
    pub fn skip(&self, descriptor: JobDescriptor, reason: StopReason) -> Termination {
        tracing::debug!(job_id = %descriptor.id, %reason, "job skipped");
        self.registry.unclaim(&descriptor.id);
        let _ = self.events.send(JobEvent::Stopped {
            job_id: descriptor.id,
            reason: reason.to_string(),
            elapsed_ms: 0,
        });
        Termination::Stopped(reason)
    }

    /// Run the job to completion. Never fails: every error becomes the job's
    /// `Failed` event and is returned for bookkeeping only.
    ///
    /// `generation` is the registry generation when the job was submitted; a
    /// `stop_all` since then stops the job before it spawns anything.
    pub async fn run(&self, descriptor: JobDescriptor, generation: u64) -> Termination {
        let started = Instant::now();
        let termination = self.execute(&descriptor, generation).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let job_id = descriptor.id;
        self.registry.unclaim(&job_id);

        let event = match &termination {
            Termination::Completed => {
                tracing::info!(job_id = %job_id, elapsed_ms, "job completed");
                JobEvent::Completed { job_id, elapsed_ms }
            }
            Termination::Failed(err) => {
                tracing::warn!(job_id = %job_id, elapsed_ms, error = %err, "job failed");
                JobEvent::Failed {
                    job_id,
                    reason: err.to_string(),
                    elapsed_ms,
                }
            }
            Termination::Stopped(reason) => {
                tracing::info!(job_id = %job_id, elapsed_ms, %reason, "job stopped");
                JobEvent::Stopped {
                    job_id,
                    reason: reason.to_string(),
                    elapsed_ms,
                }
            }
        };
        let _ = self.events.send(event);
        termination
    }

    async fn execute(&self, descriptor: &JobDescriptor, generation: u64) -> Termination {
        if let Err(err) = self.registry.admit(generation) {
            return refused(err);
        }
        if let Err(err) = self.prepare().await {
            return Termination::Failed(err);
        }
        // Admission is checked again under the registry lock, so a stop that
        // arrived during `prepare` still applies.
        let (ticket, control) = match self.registry.register(&descriptor.id, generation) {
            Ok(registration) => registration,
            Err(err) => return refused(err),
        };
        let termination = self.supervise(descriptor, control).await;
        // Released before the terminal event goes out.
        self.registry.release(&descriptor.id, ticket);
        termination
    }

    async fn prepare(&self) -> Result<(), JobError> {
        let binary = &self.config.binary;
        match tokio::fs::metadata(binary).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(JobError::BinaryNotFound {
                    path: binary.clone(),
                })
            }
        }
        tokio::fs::create_dir_all(&self.config.log_dir)
            .await
            .map_err(|source| JobError::LogDir {
                path: self.config.log_dir.clone(),
                source,
            })
    }

    async fn supervise(
        &self,
        descriptor: &JobDescriptor,
        mut control: UnboundedReceiver<JobControl>,
    ) -> Termination {
        let cfg = &self.config;
        let job_id = descriptor.id.as_str();
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let log_file = command::log_file_name(descriptor, now);
        let args = command::build_args(descriptor, &cfg.log_dir, &log_file, &cfg.extra_args);

        let mut child = match Command::new(&cfg.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return Termination::Failed(JobError::Spawn(err)),
        };
        tracing::info!(job_id, pid = ?child.id(), log_file = %log_file, "imapsync started");

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Termination::Failed(JobError::Spawn(std::io::Error::other(
                "child stdio was not captured",
            )));
        };
        let _ = self.events.send(JobEvent::Started {
            job_id: job_id.to_string(),
            log_file: cfg.log_dir.join(&log_file),
        });

        let mut io = JobIo::new(job_id, &self.events);
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut control_open = true;
        let mut stop: Option<StopReason> = None;
        let mut status: Option<ExitStatus> = None;
        let mut drain_deadline: Option<Instant> = None;

        let exit = loop {
            if let Some(s) = status {
                if !io.stdout.open && !io.stderr.open {
                    break s;
                }
            }
            tokio::select! {
                read = stdout.read(&mut out_buf), if io.stdout.open => match read {
                    Ok(0) => io.on_eof(Stream::Stdout),
                    Ok(n) => io.on_chunk(Stream::Stdout, &out_buf[..n]),
                    Err(err) => {
                        tracing::debug!(job_id, error = %err, "stdout read failed");
                        io.on_eof(Stream::Stdout);
                    }
                },
                read = stderr.read(&mut err_buf), if io.stderr.open => match read {
                    Ok(0) => io.on_eof(Stream::Stderr),
                    Ok(n) => io.on_chunk(Stream::Stderr, &err_buf[..n]),
                    Err(err) => {
                        tracing::debug!(job_id, error = %err, "stderr read failed");
                        io.on_eof(Stream::Stderr);
                    }
                },
                msg = control.recv(), if control_open && stop.is_none() && status.is_none() => match msg {
                    Some(JobControl::Stop(reason)) => {
                        tracing::info!(job_id, %reason, "stopping imapsync");
                        stop = Some(reason);
                        if let Err(err) = child.start_kill() {
                            // Already reaped; the exit status decides the outcome.
                            tracing::debug!(job_id, error = %err, "kill after exit");
                        }
                    }
                    None => control_open = false,
                },
                waited = child.wait(), if status.is_none() => match waited {
                    Ok(s) => {
                        tracing::debug!(job_id, status = %s, "imapsync exited");
                        // Nothing left to stop while draining; make stop requests say so.
                        control.close();
                        status = Some(s);
                        drain_deadline = Some(Instant::now() + cfg.drain_grace);
                    }
                    Err(err) => return Termination::Failed(JobError::Wait(err)),
                },
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    tracing::warn!(job_id, "output still open after exit, abandoning it");
                    if let Some(s) = status {
                        break s;
                    }
                    drain_deadline = None;
                }
            }
        };

        io.finish();
        classify_exit(exit, stop, io.last_stderr)
    }
}

fn refused(err: RegisterError) -> Termination {
    match err {
        RegisterError::ShuttingDown => Termination::Stopped(StopReason::Shutdown),
        RegisterError::Cancelled => Termination::Stopped(StopReason::User),
        err @ RegisterError::AlreadyRunning(_) => Termination::Failed(err.into()),
    }
}

/// Map an exit status to the job outcome.
///
/// A clean exit wins even if a stop raced it. Otherwise a requested stop wins over
/// whatever code the kill produced, and a signal death nobody asked for is a stop,
/// not a failure.
pub fn classify_exit(
    status: ExitStatus,
    stop: Option<StopReason>,
    last_stderr: Option<String>,
) -> Termination {
    if status.success() {
        return Termination::Completed;
    }
    if let Some(reason) = stop {
        return Termination::Stopped(reason);
    }
    match status.code() {
        Some(code) => Termination::Failed(JobError::ProcessExit {
            code,
            detail: last_stderr,
        }),
        None => Termination::Stopped(StopReason::Signal),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct StreamPump {
    open: bool,
    lines: LineSplitter,
    text: Utf8Chunk,
}

impl StreamPump {
    fn new() -> Self {
        Self {
            open: true,
            lines: LineSplitter::new(),
            text: Utf8Chunk::default(),
        }
    }
}

/// Per-job stream plumbing: raw chunks out as output events, stdout lines through
/// the progress extractor.
struct JobIo<'a> {
    job_id: &'a str,
    events: &'a UnboundedSender<JobEvent>,
    extractor: ProgressExtractor,
    stdout: StreamPump,
    stderr: StreamPump,
    last_stderr: Option<String>,
}

impl<'a> JobIo<'a> {
    fn new(job_id: &'a str, events: &'a UnboundedSender<JobEvent>) -> Self {
        Self {
            job_id,
            events,
            extractor: ProgressExtractor::new(job_id),
            stdout: StreamPump::new(),
            stderr: StreamPump::new(),
            last_stderr: None,
        }
    }

    fn pump(&mut self, stream: Stream) -> &mut StreamPump {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn on_chunk(&mut self, stream: Stream, bytes: &[u8]) {
        let pump = self.pump(stream);
        let text = pump.text.decode(bytes);
        let lines = pump.lines.feed(bytes);
        if !text.is_empty() {
            self.output(stream, text);
        }
        for line in lines {
            self.on_line(stream, &line);
        }
    }

    fn on_eof(&mut self, stream: Stream) {
        let pump = self.pump(stream);
        if !pump.open {
            return;
        }
        pump.open = false;
        let text = pump.text.finish();
        let rest = pump.lines.flush();
        if let Some(text) = text {
            self.output(stream, text);
        }
        if let Some(line) = rest {
            self.on_line(stream, &line);
        }
    }

    fn finish(&mut self) {
        self.on_eof(Stream::Stdout);
        self.on_eof(Stream::Stderr);
    }

    fn on_line(&mut self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => {
                if let Some(progress) = self.extractor.observe(line) {
                    let _ = self.events.send(JobEvent::Progress(progress));
                }
            }
            Stream::Stderr => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    self.last_stderr = Some(trimmed.to_string());
                }
            }
        }
    }

    fn output(&self, stream: Stream, content: String) {
        let _ = self.events.send(JobEvent::Output(OutputEvent {
            job_id: self.job_id.to_string(),
            content,
            is_error: matches!(stream, Stream::Stderr),
            timestamp: OffsetDateTime::now_utc(),
        }));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::test_helpers::{config, descriptor, drain, fake_imapsync};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn successful_run_reports_progress_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(
            dir.path(),
            r#"printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
echo "Connection on host1"
echo "Host1 Nb folders: 2 folders"
echo "Host1 Nb messages: 120 messages"
echo "Host1: Folder [INBOX]"
echo "30/120 msgs left"
echo "careful now" >&2
printf 'Transfer ended on Sun'
exit 0"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        let runner = JobRunner::new(config(bin, dir.path()), registry.clone(), tx);

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(outcome.is_completed(), "{outcome:?}");
        assert!(registry.is_empty());

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(JobEvent::Started { job_id, .. }) if job_id == "a"));
        assert!(matches!(events.last(), Some(JobEvent::Completed { job_id, .. }) if job_id == "a"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 6);
        assert_eq!((progress[4].current, progress[4].total, progress[4].percent), (90, 120, 75));
        // Unterminated final line still counts.
        assert_eq!(progress[5].percent, 100);

        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Output(o) if o.is_error && o.content.contains("careful now")
        )));
        let stdout_text: String = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Output(o) if !o.is_error => Some(o.content.as_str()),
                _ => None,
            })
            .collect();
        assert!(stdout_text.contains("Host1 Nb messages: 120 messages\n"));

        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(&args[..4], &["--host1", "h1", "--user1", "u1"]);
        let logfile = args[args.iter().position(|a| *a == "--logfile").unwrap() + 1];
        assert!(logfile.starts_with("imapsync_") && logfile.ends_with("_a_u1_to_u2.log"));
        assert_eq!(args.last(), Some(&"--nossl1"));
        assert!(dir.path().join("logs").is_dir());
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(
            dir.path(),
            "echo 'Host1 failure: Error login on [h1]' >&2\nexit 3",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(config(bin, dir.path()), JobRegistry::new(), tx);

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(matches!(
            outcome,
            Termination::Failed(JobError::ProcessExit { code: 3, .. })
        ));
        let events = drain(&mut rx);
        match events.last() {
            Some(JobEvent::Failed { reason, .. }) => {
                assert!(reason.contains("code 3"), "{reason}");
                assert!(reason.contains("Error login"), "{reason}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Completed { .. } | JobEvent::Stopped { .. })));
    }

    #[tokio::test]
    async fn missing_binary_fails_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        let runner = JobRunner::new(
            config(dir.path().join("nope"), dir.path()),
            registry.clone(),
            tx,
        );

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(matches!(
            outcome,
            Termination::Failed(JobError::BinaryNotFound { .. })
        ));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], JobEvent::Failed { reason, .. } if reason.contains("not found")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_kills_process_and_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(
            dir.path(),
            "echo 'Host1 Nb messages: 10 messages'\nexec sleep 30",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = Arc::new(JobRunner::new(config(bin, dir.path()), JobRegistry::new(), tx));

        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(descriptor("a"), 0).await }
        });
        loop {
            match rx.recv().await {
                Some(JobEvent::Started { .. }) => break,
                Some(_) => continue,
                None => panic!("channel closed before start"),
            }
        }
        assert!(runner.stop("a"));

        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("job did not stop")
            .unwrap();
        assert!(matches!(outcome, Termination::Stopped(StopReason::User)));
        assert!(!runner.registry().contains("a"));
        // Stopping again is a no-op.
        assert!(!runner.stop("a"));

        let events = drain(&mut rx);
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(terminals[0], JobEvent::Stopped { reason, .. } if reason == "stopped by user"));
    }

    #[tokio::test]
    async fn lingering_grandchild_does_not_hang_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "sleep 30 &\necho hi\nexit 0");
        let (tx, _rx) = mpsc::unbounded_channel();
        let runner = JobRunner::new(config(bin, dir.path()), JobRegistry::new(), tx);

        let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run(descriptor("a"), 0))
            .await
            .expect("job hung on open pipes");
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn closed_registry_stops_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "touch \"$(dirname \"$0\")/ran\"");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        registry.shutdown();
        let runner = JobRunner::new(config(bin, dir.path()), registry, tx);

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(matches!(outcome, Termination::Stopped(StopReason::Shutdown)));
        assert!(!dir.path().join("ran").exists());
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [JobEvent::Stopped { reason, .. }] if reason == "stopped by shutdown"));
    }

    #[tokio::test]
    async fn duplicate_live_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "exit 0");
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        let (_ticket, _control) = registry.register("a", 0).unwrap();
        let runner = JobRunner::new(config(bin, dir.path()), registry.clone(), tx);

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(matches!(
            outcome,
            Termination::Failed(JobError::Register(RegisterError::AlreadyRunning(_)))
        ));
        assert!(registry.contains("a"));
    }

    #[tokio::test]
    async fn non_executable_binary_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "exit 0");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o644)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        let runner = JobRunner::new(config(bin, dir.path()), registry.clone(), tx);

        let outcome = runner.run(descriptor("a"), 0).await;
        assert!(matches!(outcome, Termination::Failed(JobError::Spawn(_))), "{outcome:?}");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "{events:?}");
        assert!(matches!(
            &events[0],
            JobEvent::Failed { reason, .. } if reason.contains("failed to launch imapsync")
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_all_before_start_cancels_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "touch \"$(dirname \"$0\")/ran\"");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = JobRegistry::new();
        let submitted_at = registry.generation();
        registry.stop_all(StopReason::User);
        let runner = JobRunner::new(config(bin, dir.path()), registry.clone(), tx);

        let outcome = runner.run(descriptor("a"), submitted_at).await;
        assert!(matches!(outcome, Termination::Stopped(StopReason::User)));
        assert!(!dir.path().join("ran").exists());
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [JobEvent::Stopped { reason, .. }] if reason == "stopped by user"));

        // Submitted after the stop: runs normally.
        let outcome = runner.run(descriptor("b"), registry.generation()).await;
        assert!(outcome.is_completed(), "{outcome:?}");
        assert!(dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn stop_while_draining_reports_nothing_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_imapsync(dir.path(), "sleep 30 &\necho exited\nexit 0");
        let mut cfg = (*config(bin, dir.path())).clone();
        cfg.drain_grace = Duration::from_secs(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = Arc::new(JobRunner::new(Arc::new(cfg), JobRegistry::new(), tx));

        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(descriptor("a"), 0).await }
        });
        loop {
            match rx.recv().await {
                Some(JobEvent::Output(o)) if o.content.contains("exited") => break,
                Some(_) => continue,
                None => panic!("channel closed early"),
            }
        }
        // Give the runner time to reap the shell; the grandchild keeps stdout open.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(runner.registry().contains("a"));
        assert!(!runner.stop("a"));

        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("job hung")
            .unwrap();
        assert!(outcome.is_completed(), "{outcome:?}");
    }

    #[test]
    fn exit_classification() {
        let ok = ExitStatus::from_raw(0);
        let code_3 = ExitStatus::from_raw(3 << 8);
        let code_137 = ExitStatus::from_raw(137 << 8);
        let sigkill = ExitStatus::from_raw(9);

        assert!(classify_exit(ok, None, None).is_completed());
        assert!(classify_exit(ok, Some(StopReason::User), None).is_completed());
        assert!(matches!(
            classify_exit(code_3, None, Some("boom".into())),
            Termination::Failed(JobError::ProcessExit { code: 3, detail: Some(_) })
        ));
        assert!(matches!(
            classify_exit(code_137, Some(StopReason::User), None),
            Termination::Stopped(StopReason::User)
        ));
        assert!(matches!(
            classify_exit(sigkill, Some(StopReason::Shutdown), None),
            Termination::Stopped(StopReason::Shutdown)
        ));
        assert!(matches!(
            classify_exit(sigkill, None, None),
            Termination::Stopped(StopReason::Signal)
        ));
    }
}
