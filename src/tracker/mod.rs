// src/tracker/mod.rs

//! Job status table.
//!
//! The tracker is the single source of truth for job state: the engine
//! writes through it and every reader (status API, CLI) reads from it. There
//! is no separate cache. Each job record is written only by the task that
//! owns the job.
//!
//! When a journal path is configured, every write is also appended to a
//! JSON-lines file (see [`journal`]) and replayed on the next start.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{Job, JobId, JobSummary};
use crate::provision::EnvironmentHandle;
use crate::types::{FailureReason, JobState};

pub mod journal;

pub use journal::Journal;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error("status table lock poisoned")]
    Poisoned,

    #[error("journal error: {0}")]
    Journal(#[from] std::io::Error),

    #[error("journal record is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct StatusTracker {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    journal: Option<Arc<Mutex<Journal>>>,
    /// Bumped on every write so waiters can re-check.
    version: Arc<watch::Sender<u64>>,
    /// Environments still held by jobs interrupted on replay.
    orphaned: Arc<Mutex<Vec<(JobId, EnvironmentHandle)>>>,
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker")
            .field("jobs", &self.len())
            .field("journalled", &self.journal.is_some())
            .finish()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StatusTracker {
    pub fn in_memory() -> Self {
        Self::from_parts(HashMap::new(), None)
    }

    /// Open a journalled tracker, replaying what the journal already holds.
    ///
    /// Jobs that were still in flight when the journal was last written are
    /// marked `Failed(Interrupted)`: their owning task no longer exists. Any
    /// environment they held is kept for
    /// [`take_orphaned_environments`](Self::take_orphaned_environments).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref();
        let mut jobs = journal::replay(path)?;
        let mut journal = Journal::open(path)?;

        let mut interrupted = 0usize;
        let mut orphaned = Vec::new();
        for job in jobs.values_mut() {
            if !job.is_terminal()
                && job
                    .fail(FailureReason::Interrupted, "launchpad restarted while job was in flight")
                    .is_ok()
            {
                journal.append(job)?;
                interrupted += 1;
                if let Some(env) = job.environment() {
                    warn!(job_id = %job.id(), env = %env, "interrupted job left an environment behind");
                    orphaned.push((job.id(), env.clone()));
                }
            }
        }

        info!(
            path = ?path,
            jobs = jobs.len(),
            interrupted,
            "replayed job journal"
        );
        let tracker = Self::from_parts(jobs, Some(journal));
        if let Ok(mut slot) = tracker.orphaned.lock() {
            *slot = orphaned;
        }
        Ok(tracker)
    }

    /// Environments left behind by jobs interrupted on replay. Each is
    /// handed out once.
    pub fn take_orphaned_environments(&self) -> Vec<(JobId, EnvironmentHandle)> {
        self.orphaned
            .lock()
            .map(|mut orphaned| std::mem::take(&mut *orphaned))
            .unwrap_or_default()
    }

    fn from_parts(jobs: HashMap<JobId, Job>, journal: Option<Journal>) -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            jobs: Arc::new(RwLock::new(jobs)),
            journal: journal.map(|j| Arc::new(Mutex::new(j))),
            version: Arc::new(version),
            orphaned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a new job.
    pub fn insert(&self, job: Job) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| TrackerError::Poisoned)?;
        if jobs.contains_key(&job.id()) {
            return Err(TrackerError::Duplicate(job.id()));
        }
        self.persist(&job);
        jobs.insert(job.id(), job);
        drop(jobs);
        self.bump();
        Ok(())
    }

    /// Mutate one job in place and persist the result.
    pub fn update<F, R>(&self, id: &JobId, f: F) -> Result<R, TrackerError>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut jobs = self.jobs.write().map_err(|_| TrackerError::Poisoned)?;
        let job = jobs.get_mut(id).ok_or(TrackerError::NotFound(*id))?;
        let out = f(job);
        self.persist(job);
        drop(jobs);
        self.bump();
        Ok(out)
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().ok()?.get(id).cloned()
    }

    /// Summaries of `owner`'s jobs, oldest first.
    pub fn list(&self, owner: &str) -> Vec<JobSummary> {
        let Ok(jobs) = self.jobs.read() else {
            return Vec::new();
        };
        let mut out: Vec<JobSummary> = jobs
            .values()
            .filter(|j| j.spec().owner() == owner)
            .map(Job::summary)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Wait until `pred` holds for the job, returning the matching snapshot.
    ///
    /// Returns `None` if the job does not exist.
    pub async fn wait_until<P>(&self, id: &JobId, pred: P) -> Option<Job>
    where
        P: Fn(&Job) -> bool,
    {
        let mut rx = self.version.subscribe();
        loop {
            let job = self.get(id)?;
            if pred(&job) {
                return Some(job);
            }
            if rx.changed().await.is_err() {
                return self.get(id);
            }
        }
    }

    pub async fn wait_for_terminal(&self, id: &JobId) -> Option<Job> {
        self.wait_until(id, Job::is_terminal).await
    }

    pub async fn wait_for_state(&self, id: &JobId, state: JobState) -> Option<Job> {
        self.wait_until(id, |j| j.state() == state || j.is_terminal())
            .await
    }

    fn persist(&self, job: &Job) {
        let Some(journal) = &self.journal else {
            return;
        };
        let result = match journal.lock() {
            Ok(mut journal) => journal.append(job),
            Err(_) => Err(TrackerError::Poisoned),
        };
        if let Err(e) = result {
            warn!(job_id = %job.id(), error = %e, "failed to journal job record");
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}
