use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// The happy path is `Queued → Provisioning → Transferring → Starting →
/// Running → Completed`. `Failed` and `Cancelled` may be entered from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Provisioning,
    Transferring,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }

        match next {
            Failed | Cancelled => true,
            Provisioning => self == Queued,
            Transferring => self == Provisioning,
            Starting => self == Transferring,
            Running => self == Starting,
            Completed => self == Running,
            Queued => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Provisioning => "provisioning",
            JobState::Transferring => "transferring",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Machine-readable reason recorded when a job ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// `create` kept returning a transient error until attempts ran out.
    ProviderUnavailable,
    QuotaExceeded,
    InvalidSpec,
    /// The provider credential is not allowed to create environments.
    Unauthorized,
    /// The provider reported the environment as failed or terminated.
    ProvisionFailed,
    ProvisionTimeout,
    StorageError,
    TransferFailed,
    StartFailed,
    StartTimeout,
    NonZeroExit,
    HealthCheckFailed,
    Unresponsive,
    /// The process stopped while the job was in flight (journal replay).
    Interrupted,
    InternalError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::QuotaExceeded => "quota_exceeded",
            FailureReason::InvalidSpec => "invalid_spec",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::ProvisionFailed => "provision_failed",
            FailureReason::ProvisionTimeout => "provision_timeout",
            FailureReason::StorageError => "storage_error",
            FailureReason::TransferFailed => "transfer_failed",
            FailureReason::StartFailed => "start_failed",
            FailureReason::StartTimeout => "start_timeout",
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::HealthCheckFailed => "health_check_failed",
            FailureReason::Unresponsive => "unresponsive",
            FailureReason::Interrupted => "interrupted",
            FailureReason::InternalError => "internal_error",
        }
    }

    /// Timeout-class reasons, one per bounded phase.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            FailureReason::ProvisionTimeout
                | FailureReason::StartTimeout
                | FailureReason::Unresponsive
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where uploaded artifacts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Store blobs under `[store].root` on disk.
    File,
    /// Keep blobs in memory only (lost on restart).
    Memory,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::File
    }
}

impl FromStr for StoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StoreMode::File),
            "memory" => Ok(StoreMode::Memory),
            other => Err(format!(
                "invalid store mode: {other} (expected \"file\" or \"memory\")"
            )),
        }
    }
}

/// Which compute provider backs environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Environments are local working directories and child processes.
    Local,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::Local
    }
}
