//! Process-wide table of live jobs.
//!
//! Each entry holds the job's control sender, not the child process: the runner that
//! spawned the process owns it and is the only one that kills it. Stopping a job is a
//! message send, so a job that finished between lookup and delivery simply never
//! reads the message.
//!
//! Besides live entries the registry tracks claimed ids (submitted and not yet
//! finished) and a stop-all generation. A job carries the generation current at its
//! submission; once `stop_all` has moved past it the job can no longer register.
//! Both checks happen under the same lock as registration.

use crate::error::{RegisterError, StopReason};
use crate::model::JobDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Messages a runner accepts from outside while its process is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Stop(StopReason),
}

/// Identifies one registration, so a stale runner cannot remove a newer entry
/// that reused the same job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

struct Entry {
    ticket: Ticket,
    control: UnboundedSender<JobControl>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    claimed: HashSet<String>,
    next_ticket: u64,
    generation: u64,
    closed: bool,
}

impl Inner {
    fn admission(&self, generation: u64) -> Result<(), RegisterError> {
        if self.closed {
            Err(RegisterError::ShuttingDown)
        } else if generation < self.generation {
            Err(RegisterError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn signal_all(&self, reason: StopReason) -> usize {
        let mut signalled = 0;
        for (job_id, entry) in &self.jobs {
            match entry.control.send(JobControl::Stop(reason)) {
                Ok(()) => signalled += 1,
                // Process already exited; keep going with the rest.
                Err(_) => tracing::debug!(job_id = %job_id, "job no longer accepts stop"),
            }
        }
        signalled
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept submitted jobs whose id is neither claimed nor live. Duplicates are
    /// dropped without any event, so each id has one lifecycle at a time.
    pub fn claim(&self, jobs: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
        let mut inner = self.lock();
        let mut accepted = Vec::with_capacity(jobs.len());
        for job in jobs {
            if inner.jobs.contains_key(&job.id) || !inner.claimed.insert(job.id.clone()) {
                tracing::warn!(job_id = %job.id, "job already submitted, ignoring duplicate");
                continue;
            }
            accepted.push(job);
        }
        accepted
    }

    /// Give up a claim. Called before the job's terminal event goes out.
    pub fn unclaim(&self, job_id: &str) {
        self.lock().claimed.remove(job_id);
    }

    /// Current stop-all generation, to be captured when a job is submitted.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether a job submitted at `generation` may still start.
    pub fn admit(&self, generation: u64) -> Result<(), RegisterError> {
        self.lock().admission(generation)
    }

    pub fn register(
        &self,
        job_id: &str,
        generation: u64,
    ) -> Result<(Ticket, UnboundedReceiver<JobControl>), RegisterError> {
        let mut inner = self.lock();
        inner.admission(generation)?;
        if inner.jobs.contains_key(job_id) {
            return Err(RegisterError::AlreadyRunning(job_id.to_string()));
        }
        inner.next_ticket += 1;
        let ticket = Ticket(inner.next_ticket);
        let (control, rx) = mpsc::unbounded_channel();
        inner
            .jobs
            .insert(job_id.to_string(), Entry { ticket, control });
        Ok((ticket, rx))
    }

    /// Remove the entry for `job_id` if it still belongs to `ticket`.
    pub fn release(&self, job_id: &str, ticket: Ticket) {
        let mut inner = self.lock();
        if inner.jobs.get(job_id).is_some_and(|e| e.ticket == ticket) {
            inner.jobs.remove(job_id);
        }
    }

    /// Ask a live job to stop. Returns false when nothing was signalled, including
    /// when the process has already exited and the runner is only draining output.
    pub fn stop(&self, job_id: &str, reason: StopReason) -> bool {
        let inner = self.lock();
        match inner.jobs.get(job_id) {
            Some(entry) => entry.control.send(JobControl::Stop(reason)).is_ok(),
            None => {
                tracing::debug!(job_id, "stop requested for unknown job, ignoring");
                false
            }
        }
    }

    /// Stop every live job and cancel every job submitted before this call that has
    /// not registered yet. Later submissions are unaffected.
    pub fn stop_all(&self, reason: StopReason) -> usize {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.signal_all(reason)
    }

    /// Close to new jobs and ask every live job to stop. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        inner.signal_all(StopReason::Shutdown)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.lock().jobs.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().jobs.contains_key(job_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
