// src/engine/dispatcher.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::lifecycle::{EngineContext, JobRun};
use crate::engine::{DispatchError, Job, JobId};
use crate::launch;
use crate::provision::{EnvironmentAgent, Provisioner};
use crate::store::ArtifactStore;
use crate::tracker::StatusTracker;
use crate::types::{FailureReason, JobState};

use super::policy::DispatchPolicy;

/// Result of a successful cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag was raised; the job will move to `Cancelled` at its next
    /// suspension point.
    Requested,
    /// The job is already `Cancelled`.
    AlreadyCancelled,
}

/// Entry point of the engine: validates launch requests, spawns one task per
/// job and routes cancellation requests to it.
///
/// `submit` spawns onto the current Tokio runtime and must be called from
/// within one.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<EngineContext>,
    cancels: Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracker", &self.ctx.tracker)
            .field("policy", &self.ctx.policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        provisioner: Arc<dyn Provisioner>,
        agent: Arc<dyn EnvironmentAgent>,
        tracker: StatusTracker,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineContext {
                store,
                provisioner,
                agent,
                tracker,
                policy,
            }),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.ctx.tracker
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.ctx.store
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.ctx.policy
    }

    /// Validate and queue a launch. No job is created if validation fails.
    pub fn submit(
        &self,
        owner: &str,
        artifact_hash: &str,
        start_command: &str,
    ) -> Result<JobId, DispatchError> {
        let spec = launch::validate(
            self.ctx.store.as_ref(),
            owner,
            artifact_hash,
            start_command,
            self.ctx.policy.max_command_len,
        )?;

        let id = JobId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.lock_cancels()?.insert(id, cancel_tx);

        if let Err(e) = self.ctx.tracker.insert(Job::new(id, spec.clone())) {
            self.lock_cancels()?.remove(&id);
            return Err(e.into());
        }

        info!(
            job_id = %id,
            owner = %owner,
            artifact = %spec.artifact(),
            "job queued"
        );

        let run = JobRun::new(Arc::clone(&self.ctx), id, spec, cancel_rx);
        let handle = tokio::spawn(run.run());

        // Supervise: a job task that dies without reaching a terminal state
        // is recorded as an internal failure.
        let tracker = self.ctx.tracker.clone();
        let cancels = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                error!(job_id = %id, error = %join_err, "job task aborted");
                let recorded = tracker.update(&id, |job| {
                    if !job.is_terminal() {
                        let _ = job.fail(
                            FailureReason::InternalError,
                            format!("job task aborted: {join_err}"),
                        );
                    }
                });
                if let Err(e) = recorded {
                    error!(job_id = %id, error = %e, "could not record aborted job");
                }
            }
            if let Ok(mut cancels) = cancels.lock() {
                cancels.remove(&id);
            }
        });

        Ok(id)
    }

    /// Request cancellation. Idempotent for jobs that are still in flight or
    /// already cancelled; refused for completed or failed jobs.
    pub fn cancel(&self, id: &JobId) -> Result<CancelOutcome, DispatchError> {
        let job = self
            .ctx
            .tracker
            .get(id)
            .ok_or(DispatchError::JobNotFound(*id))?;
        if let Some(outcome) = terminal_outcome(&job)? {
            return Ok(outcome);
        }

        self.raise_cancel(id)
    }

    /// Raise the job's cancel flag, then re-read its record: the job task
    /// may have recorded a terminal state since the caller last looked.
    fn raise_cancel(&self, id: &JobId) -> Result<CancelOutcome, DispatchError> {
        let raised = match self.lock_cancels()?.get(id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        };

        let job = self
            .ctx
            .tracker
            .get(id)
            .ok_or(DispatchError::JobNotFound(*id))?;
        let outcome = terminal_outcome(&job)?;
        if raised {
            info!(job_id = %id, state = %job.state(), "cancellation requested");
            return Ok(CancelOutcome::Requested);
        }

        outcome.ok_or(DispatchError::Internal(format!(
            "job {id} has no running task but is {}",
            job.state()
        )))
    }

    /// Terminate environments still held by jobs that a restart
    /// interrupted. Returns how many were released.
    pub async fn reclaim_orphaned_environments(&self) -> usize {
        let limit = self.ctx.policy.request_timeout;
        let mut released = 0;
        for (job_id, handle) in self.ctx.tracker.take_orphaned_environments() {
            match tokio::time::timeout(limit, self.ctx.provisioner.terminate(handle.clone())).await {
                Ok(Ok(())) => {
                    info!(job_id = %job_id, env = %handle, "released orphaned environment");
                    released += 1;
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job_id, env = %handle, error = %e, "could not release orphaned environment")
                }
                Err(_) => {
                    warn!(job_id = %job_id, env = %handle, "terminating orphaned environment timed out")
                }
            }
        }
        released
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.ctx.tracker.get(id)
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self, id: &JobId) -> Option<Job> {
        self.ctx.tracker.wait_for_terminal(id).await
    }

    fn lock_cancels(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>>, DispatchError>
    {
        self.cancels
            .lock()
            .map_err(|_| DispatchError::Internal("cancel table lock poisoned".to_string()))
    }
}

/// What cancelling a job in its current state means, if it is terminal.
fn terminal_outcome(job: &Job) -> Result<Option<CancelOutcome>, DispatchError> {
    match job.state() {
        JobState::Cancelled => Ok(Some(CancelOutcome::AlreadyCancelled)),
        state @ (JobState::Completed | JobState::Failed) => Err(DispatchError::AlreadyTerminal {
            id: job.id(),
            state,
        }),
        _ => Ok(None),
    }
}
