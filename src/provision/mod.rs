// src/provision/mod.rs

//! Remote environment provisioning abstraction.
//!
//! The dispatch engine talks to two narrow capabilities instead of a
//! concrete compute API:
//!
//! - [`Provisioner`]: create / poll / terminate an ephemeral environment.
//! - [`EnvironmentAgent`]: the environment endpoint, used to push the
//!   artifact, start the command and observe the running process.
//!
//! [`local::LocalProvider`] implements both on top of working directories and
//! child processes. Tests provide scripted implementations instead.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::FailureReason;

pub mod local;

pub use local::LocalProvider;

/// Boxed future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// Opaque provider-side identifier of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentHandle(pub String);

impl fmt::Display for EnvironmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvState {
    Provisioning,
    Ready,
    Failed,
    Terminated,
}

/// Snapshot of an environment as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub handle: EnvironmentHandle,
    pub state: EnvState,
    /// Where the environment can be reached once `Ready`.
    pub endpoint: Option<String>,
}

/// What the engine asks the provider for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRequest {
    pub job_id: String,
    pub owner: String,
}

/// Acknowledgment that the start command's process began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAck {
    pub detail: String,
}

/// Terminal signal observed from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSignal {
    Exited { code: i32 },
    HealthCheckFailed { detail: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transient; the caller may retry.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid environment spec: {0}")]
    InvalidSpec(String),

    #[error("provider credential not authorized: {0}")]
    Unauthorized(String),

    /// Artifact push failed; retried by the transfer policy.
    #[error("artifact transfer failed: {0}")]
    Transfer(String),

    #[error("start command failed: {0}")]
    Start(String),

    #[error("unknown environment: {0}")]
    UnknownEnvironment(EnvironmentHandle),
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Unavailable(_) | ProvisionError::Transfer(_))
    }

    /// Reason recorded on the job when this error ends it.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ProvisionError::QuotaExceeded(_) => FailureReason::QuotaExceeded,
            ProvisionError::Unavailable(_) => FailureReason::ProviderUnavailable,
            ProvisionError::InvalidSpec(_) => FailureReason::InvalidSpec,
            ProvisionError::Unauthorized(_) => FailureReason::Unauthorized,
            ProvisionError::Transfer(_) => FailureReason::TransferFailed,
            ProvisionError::Start(_) => FailureReason::StartFailed,
            ProvisionError::UnknownEnvironment(_) => FailureReason::ProvisionFailed,
        }
    }
}

/// Capability to manage ephemeral environments.
pub trait Provisioner: Send + Sync {
    /// Request a new environment. The environment is usually not ready yet;
    /// use [`Provisioner::poll`] to observe progress.
    fn create(&self, request: EnvironmentRequest) -> ProviderFuture<'_, EnvironmentHandle>;

    fn poll(&self, handle: EnvironmentHandle) -> ProviderFuture<'_, Environment>;

    /// Tear the environment down. Terminating twice is not an error.
    fn terminate(&self, handle: EnvironmentHandle) -> ProviderFuture<'_, ()>;
}

/// Operations against a ready environment's endpoint.
pub trait EnvironmentAgent: Send + Sync {
    fn push_artifact(
        &self,
        environment: Environment,
        filename: String,
        bytes: Vec<u8>,
    ) -> ProviderFuture<'_, ()>;

    /// Launch `command`; resolves once the process has begun.
    fn start(&self, environment: Environment, command: String) -> ProviderFuture<'_, StartAck>;

    /// Resolves when the command exits or its health check fails.
    fn observe(&self, environment: Environment) -> ProviderFuture<'_, RunSignal>;
}
