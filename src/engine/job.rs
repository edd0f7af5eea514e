// src/engine/job.rs

//! Job records and their state-machine guarded mutation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::launch::LaunchSpec;
use crate::provision::EnvironmentHandle;
use crate::store::ContentHash;
use crate::types::{FailureReason, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(JobId)
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub state: JobState,
    pub detail: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal transition {from} -> {to} for job {job}")]
pub struct TransitionError {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// One end-to-end launch: provision, deliver the artifact, run the command.
///
/// State only moves through [`Job::transition`] / [`Job::fail`], which refuse
/// anything [`JobState::can_transition_to`] does not allow. Once terminal,
/// the record never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    spec: LaunchSpec,
    environment: Option<EnvironmentHandle>,
    state: JobState,
    reason: Option<FailureReason>,
    history: Vec<HistoryEntry>,
}

impl Job {
    /// A freshly accepted job in `Queued`, with one history entry.
    pub fn new(id: JobId, spec: LaunchSpec) -> Self {
        let detail = format!("accepted: {}", spec.start_command());
        Self {
            id,
            spec,
            environment: None,
            state: JobState::Queued,
            reason: None,
            history: vec![HistoryEntry {
                at: Utc::now(),
                state: JobState::Queued,
                detail,
            }],
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn reason(&self) -> Option<FailureReason> {
        self.reason
    }

    pub fn environment(&self) -> Option<&EnvironmentHandle> {
        self.environment.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(
        &mut self,
        next: JobState,
        detail: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(HistoryEntry {
            at: Utc::now(),
            state: next,
            detail: detail.into(),
        });
        Ok(())
    }

    /// Move to `Failed`, recording `reason`.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(JobState::Failed, detail)?;
        self.reason = Some(reason);
        Ok(())
    }

    pub fn attach_environment(&mut self, handle: EnvironmentHandle) {
        if !self.is_terminal() {
            self.environment = Some(handle);
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            artifact: self.spec.artifact().clone(),
            start_command: self.spec.start_command().to_string(),
            state: self.state,
            reason: self.reason,
            created_at: self.spec.created_at(),
            updated_at: self
                .history
                .last()
                .map(|h| h.at)
                .unwrap_or_else(|| self.spec.created_at()),
        }
    }
}

/// Compact view of a job for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub artifact: ContentHash,
    pub start_command: String,
    pub state: JobState,
    pub reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
