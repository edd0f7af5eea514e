// src/engine/lifecycle.rs

//! Per-job lifecycle driver.
//!
//! One [`JobRun`] owns one job from `Queued` to a terminal state. It is the
//! only writer of that job's record, so transitions for a job are strictly
//! sequential. Every suspension point is raced against the job's
//! cancellation flag and bounded by a timeout from [`DispatchPolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{JobId, Job};
use crate::launch::LaunchSpec;
use crate::provision::{
    EnvState, Environment, EnvironmentAgent, EnvironmentHandle, EnvironmentRequest,
    ProvisionError, Provisioner, RunSignal,
};
use crate::store::ArtifactStore;
use crate::tracker::StatusTracker;
use crate::types::{FailureReason, JobState};

use super::policy::DispatchPolicy;

/// Collaborators shared by every job.
pub struct EngineContext {
    pub store: Arc<dyn ArtifactStore>,
    pub provisioner: Arc<dyn Provisioner>,
    pub agent: Arc<dyn EnvironmentAgent>,
    pub tracker: StatusTracker,
    pub policy: DispatchPolicy,
}

/// Why a job left the happy path.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Failed {
        reason: FailureReason,
        detail: String,
    },
}

impl Interrupt {
    fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Interrupt::Failed {
            reason,
            detail: detail.into(),
        }
    }
}

impl From<ProvisionError> for Interrupt {
    fn from(e: ProvisionError) -> Self {
        Interrupt::failed(e.failure_reason(), e.to_string())
    }
}

type Step<T> = Result<T, Interrupt>;

/// Resolve once cancellation has been requested. Never resolves if the
/// sending side is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Await `fut` for at most `limit`, giving up early on cancellation.
///
/// `Ok(None)` means the limit elapsed.
async fn suspend<F, T>(
    cancel: &mut watch::Receiver<bool>,
    limit: Duration,
    fut: F,
) -> Step<Option<T>>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(Interrupt::Cancelled),
        res = tokio::time::timeout(limit, fut) => Ok(res.ok()),
    }
}

async fn pause(cancel: &mut watch::Receiver<bool>, delay: Duration) -> Step<()> {
    suspend(cancel, delay, std::future::pending::<()>())
        .await
        .map(|_| ())
}

pub(crate) struct JobRun {
    ctx: Arc<EngineContext>,
    id: JobId,
    spec: LaunchSpec,
    cancel: watch::Receiver<bool>,
    environment: Option<EnvironmentHandle>,
}

impl JobRun {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        id: JobId,
        spec: LaunchSpec,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            id,
            spec,
            cancel,
            environment: None,
        }
    }

    /// Drive the job to a terminal state.
    pub(crate) async fn run(mut self) {
        let outcome = self.execute().await;
        self.finish(outcome).await;
    }

    async fn execute(&mut self) -> Step<()> {
        if *self.cancel.borrow() {
            return Err(Interrupt::Cancelled);
        }

        self.enter(JobState::Provisioning, "requesting environment")?;
        let (handle, attempts) = self.create_environment().await?;
        self.environment = Some(handle.clone());
        self.record(|job| job.attach_environment(handle.clone()))
            .map_err(|e| Interrupt::failed(FailureReason::InternalError, e))?;

        let environment = self.await_ready(handle, attempts).await?;
        self.enter(
            JobState::Transferring,
            format!(
                "environment {} ready at {}",
                environment.handle,
                environment.endpoint.as_deref().unwrap_or("<no endpoint>")
            ),
        )?;

        let size = self.transfer(&environment).await?;
        self.enter(
            JobState::Starting,
            format!("artifact {} transferred ({size} bytes)", self.spec.artifact()),
        )?;

        let ack = match suspend(
            &mut self.cancel,
            self.ctx.policy.start_timeout,
            self.ctx
                .agent
                .start(environment.clone(), self.spec.start_command().to_string()),
        )
        .await?
        {
            Some(Ok(ack)) => ack,
            Some(Err(e)) => return Err(Interrupt::failed(FailureReason::StartFailed, e.to_string())),
            None => {
                return Err(Interrupt::failed(
                    FailureReason::StartTimeout,
                    format!(
                        "no start acknowledgment within {:?}",
                        self.ctx.policy.start_timeout
                    ),
                ));
            }
        };
        self.enter(JobState::Running, format!("command started: {}", ack.detail))?;

        let signal = match suspend(
            &mut self.cancel,
            self.ctx.policy.run_window,
            self.ctx.agent.observe(environment.clone()),
        )
        .await?
        {
            Some(Ok(signal)) => signal,
            Some(Err(e)) => {
                return Err(Interrupt::failed(FailureReason::HealthCheckFailed, e.to_string()));
            }
            None => {
                return Err(Interrupt::failed(
                    FailureReason::Unresponsive,
                    format!("no exit or health signal within {:?}", self.ctx.policy.run_window),
                ));
            }
        };

        match signal {
            RunSignal::Exited { code: 0 } => {
                self.enter(JobState::Completed, "command exited with code 0")
            }
            RunSignal::Exited { code } => Err(Interrupt::failed(
                FailureReason::NonZeroExit,
                format!("command exited with code {code}"),
            )),
            RunSignal::HealthCheckFailed { detail } => {
                Err(Interrupt::failed(FailureReason::HealthCheckFailed, detail))
            }
        }
    }

    /// `create` with exponential backoff on transient errors. Returns the
    /// handle and how many attempts it took.
    async fn create_environment(&mut self) -> Step<(EnvironmentHandle, u32)> {
        let retry = self.ctx.policy.provision_retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let request = EnvironmentRequest {
                job_id: self.id.to_string(),
                owner: self.spec.owner().to_string(),
            };

            let error = match suspend(
                &mut self.cancel,
                self.ctx.policy.request_timeout,
                self.ctx.provisioner.create(request),
            )
            .await?
            {
                Some(Ok(handle)) => return Ok((handle, attempt)),
                Some(Err(e)) if e.is_retryable() => e,
                Some(Err(e)) => return Err(e.into()),
                None => ProvisionError::Unavailable(format!(
                    "create did not answer within {:?}",
                    self.ctx.policy.request_timeout
                )),
            };

            if attempt >= retry.max_attempts {
                return Err(Interrupt::failed(
                    FailureReason::ProviderUnavailable,
                    format!("gave up after {attempt} attempts: {error}"),
                ));
            }

            let delay = retry.delay_for(attempt);
            warn!(
                job_id = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "environment create failed; retrying"
            );
            pause(&mut self.cancel, delay).await?;
        }
    }

    /// Poll until the environment is `Ready` or the provisioning timeout
    /// elapses.
    async fn await_ready(&mut self, handle: EnvironmentHandle, attempts: u32) -> Step<Environment> {
        let policy = self.ctx.policy;
        // No deadline when the timeout is too far out to represent.
        let deadline = Instant::now().checked_add(policy.provision_timeout);
        let remaining = || {
            deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
        };

        loop {
            let left = remaining();
            if left.is_zero() {
                return Err(Interrupt::failed(
                    FailureReason::ProvisionTimeout,
                    format!(
                        "environment {handle} not ready within {:?}",
                        policy.provision_timeout
                    ),
                ));
            }

            match suspend(
                &mut self.cancel,
                left.min(policy.request_timeout),
                self.ctx.provisioner.poll(handle.clone()),
            )
            .await?
            {
                Some(Ok(env)) => match env.state {
                    EnvState::Ready => {
                        debug!(job_id = %self.id, env = %handle, attempts, "environment ready");
                        return Ok(env);
                    }
                    EnvState::Provisioning => {}
                    EnvState::Failed | EnvState::Terminated => {
                        return Err(Interrupt::failed(
                            FailureReason::ProvisionFailed,
                            format!("environment {handle} reported {:?}", env.state),
                        ));
                    }
                },
                Some(Err(e)) if e.is_retryable() => {
                    debug!(job_id = %self.id, env = %handle, error = %e, "transient poll error");
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!(job_id = %self.id, env = %handle, "poll timed out");
                }
            }

            pause(&mut self.cancel, policy.poll_interval.min(remaining())).await?;
        }
    }

    /// Fetch the artifact and push it, retrying up to the transfer bound.
    async fn transfer(&mut self, environment: &Environment) -> Step<usize> {
        let policy = self.ctx.policy;
        let bytes = self.ctx.store.get(self.spec.artifact()).map_err(|e| {
            Interrupt::failed(FailureReason::StorageError, e.to_string())
        })?;
        let size = bytes.len();

        let mut last_error = String::new();
        for attempt in 1..=policy.transfer_attempts {
            match suspend(
                &mut self.cancel,
                policy.transfer_timeout,
                self.ctx.agent.push_artifact(
                    environment.clone(),
                    self.spec.filename().to_string(),
                    bytes.clone(),
                ),
            )
            .await?
            {
                Some(Ok(())) => return Ok(size),
                Some(Err(e)) if e.is_retryable() => last_error = e.to_string(),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    last_error = format!("attempt timed out after {:?}", policy.transfer_timeout)
                }
            }

            if attempt < policy.transfer_attempts {
                warn!(
                    job_id = %self.id,
                    attempt,
                    error = %last_error,
                    "artifact transfer failed; retrying"
                );
                pause(&mut self.cancel, policy.transfer_retry_delay).await?;
            }
        }

        Err(Interrupt::failed(
            FailureReason::TransferFailed,
            format!(
                "gave up after {} attempts: {last_error}",
                policy.transfer_attempts
            ),
        ))
    }

    /// Record the terminal state and release the environment.
    async fn finish(&mut self, outcome: Step<()>) {
        let terminate = match outcome {
            Ok(()) => self.ctx.policy.terminate_on_finish,
            Err(Interrupt::Cancelled) => {
                if let Err(e) = self.enter(JobState::Cancelled, "cancelled by request") {
                    warn!(job_id = %self.id, ?e, "could not record cancellation");
                }
                true
            }
            Err(Interrupt::Failed { reason, detail }) => {
                warn!(job_id = %self.id, reason = %reason, detail = %detail, "job failed");
                let recorded = self.record(|job| job.fail(reason, detail.clone()));
                if !matches!(recorded, Ok(Ok(()))) {
                    warn!(job_id = %self.id, "could not record failure");
                }
                self.ctx.policy.terminate_on_finish
            }
        };

        if let Some(job) = self.ctx.tracker.get(&self.id) {
            info!(
                job_id = %self.id,
                state = %job.state(),
                reason = ?job.reason(),
                "job reached terminal state"
            );
        }

        if terminate {
            if let Some(handle) = self.environment.take() {
                self.terminate(handle).await;
            }
        }
    }

    async fn terminate(&self, handle: EnvironmentHandle) {
        let limit = self.ctx.policy.request_timeout;
        match tokio::time::timeout(limit, self.ctx.provisioner.terminate(handle.clone())).await {
            Ok(Ok(())) => debug!(job_id = %self.id, env = %handle, "environment terminated"),
            Ok(Err(e)) => {
                warn!(job_id = %self.id, env = %handle, error = %e, "terminate failed")
            }
            Err(_) => warn!(job_id = %self.id, env = %handle, "terminate timed out"),
        }
    }

    fn enter(&self, state: JobState, detail: impl Into<String>) -> Step<()> {
        let detail = detail.into();
        debug!(job_id = %self.id, state = %state, detail = %detail, "job transition");
        match self.record(|job| job.transition(state, detail)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Interrupt::failed(FailureReason::InternalError, e.to_string())),
            Err(e) => Err(Interrupt::failed(FailureReason::InternalError, e)),
        }
    }

    fn record<R>(&self, f: impl FnOnce(&mut Job) -> R) -> Result<R, String> {
        self.ctx
            .tracker
            .update(&self.id, f)
            .map_err(|e| e.to_string())
    }
}
