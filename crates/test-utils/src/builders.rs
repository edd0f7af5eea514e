#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use launchpad::api::Router;
use launchpad::engine::{DispatchPolicy, Dispatcher, RetryPolicy};
use launchpad::store::{Artifact, ArtifactStore, MemoryArtifactStore};
use launchpad::tracker::StatusTracker;

use crate::fake_provider::ScriptedProvider;

/// The 10-byte artifact used throughout the scenario tests.
pub const BUNDLE: &[u8] = b"0123456789";

/// A policy with millisecond-scale delays so real-time tests finish fast.
pub fn fast_policy() -> DispatchPolicy {
    DispatchPolicy {
        provision_retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        request_timeout: Duration::from_millis(200),
        provision_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(1),
        transfer_attempts: 3,
        transfer_retry_delay: Duration::from_millis(1),
        transfer_timeout: Duration::from_millis(200),
        start_timeout: Duration::from_millis(200),
        run_window: Duration::from_secs(2),
        ..DispatchPolicy::default()
    }
}

/// Builder for a [`Dispatcher`] backed by a memory store, an in-memory
/// tracker and a [`ScriptedProvider`].
pub struct DispatcherBuilder {
    provider: ScriptedProvider,
    policy: DispatchPolicy,
    tracker: StatusTracker,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            provider: ScriptedProvider::new(),
            policy: fast_policy(),
            tracker: StatusTracker::in_memory(),
        }
    }

    pub fn with_provider(mut self, provider: ScriptedProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tracker(mut self, tracker: StatusTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(MemoryArtifactStore::new());
        let provider = Arc::new(self.provider);
        let dispatcher = Dispatcher::new(
            store.clone(),
            provider.clone(),
            provider.clone(),
            self.tracker,
            self.policy,
        );
        Harness {
            dispatcher,
            store,
            provider,
        }
    }
}

/// Everything a dispatch test needs to drive and inspect a job.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub store: Arc<MemoryArtifactStore>,
    pub provider: Arc<ScriptedProvider>,
}

impl Harness {
    /// Upload [`BUNDLE`] as `bundle.zip` for `owner`.
    pub fn upload(&self, owner: &str) -> Artifact {
        self.store.put(owner, "bundle.zip", BUNDLE).unwrap()
    }

    pub fn router(&self) -> Router {
        Router::new(self.dispatcher.clone())
    }
}
