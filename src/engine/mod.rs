// src/engine/mod.rs

//! Dispatch engine.
//!
//! This module ties together:
//! - job records and their state machine ([`job`])
//! - retry / timeout policy ([`policy`])
//! - the per-job lifecycle driver that talks to the provider ([`lifecycle`])
//! - the [`Dispatcher`] front door that validates, spawns and cancels jobs
//!
//! Each job runs in its own Tokio task; the [`StatusTracker`] is the shared
//! record every reader polls.
//!
//! [`StatusTracker`]: crate::tracker::StatusTracker

use thiserror::Error;

use crate::launch::ValidationError;
use crate::tracker::TrackerError;
use crate::types::JobState;

pub mod dispatcher;
pub mod job;
pub mod lifecycle;
pub mod policy;

pub use dispatcher::{CancelOutcome, Dispatcher};
pub use job::{HistoryEntry, Job, JobId, JobSummary, TransitionError};
pub use policy::{DispatchPolicy, RetryPolicy};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {id} is already {state}")]
    AlreadyTerminal { id: JobId, state: JobState },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("internal dispatch error: {0}")]
    Internal(String),
}
