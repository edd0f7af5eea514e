// tests/retry_and_timeouts.rs
//
// These run on a paused clock: Tokio advances time whenever every task is
// idle, so multi-minute timeouts complete instantly and elapsed times are
// exact.

mod common;
use crate::common::{
    assert_valid_path, init_tracing, states, CreateScript, DispatcherBuilder, ReadyScript,
    RunScript, ScriptedProvider, StartScript,
};

use std::error::Error;
use std::time::Duration;

use tokio::time::Instant;

use launchpad::engine::{DispatchPolicy, RetryPolicy};
use launchpad::types::{FailureReason, JobState};

type TestResult = Result<(), Box<dyn Error>>;

fn policy_with_attempts(max_attempts: u32) -> DispatchPolicy {
    DispatchPolicy {
        provision_retry: RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        },
        ..DispatchPolicy::default()
    }
}

#[tokio::test(start_paused = true)]
async fn persistent_unavailability_stops_after_max_attempts() -> TestResult {
    init_tracing();
    let h = DispatcherBuilder::new()
        .with_policy(policy_with_attempts(4))
        .with_provider(ScriptedProvider::new().with_create(CreateScript::AlwaysUnavailable))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.reason(), Some(FailureReason::ProviderUnavailable));
    assert_eq!(h.provider.create_calls(), 4);

    // Backoff between the four calls: 1s + 2s + 4s.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");

    // Retries are not recorded as separate history entries.
    assert_eq!(
        states(&job),
        vec![JobState::Queued, JobState::Provisioning, JobState::Failed]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn transient_unavailability_recovers() -> TestResult {
    init_tracing();
    let h = DispatcherBuilder::new()
        .with_policy(policy_with_attempts(5))
        .with_provider(ScriptedProvider::new().with_create(CreateScript::UnavailableTimes(2)))
        .build();
    let artifact = h.upload("alice");

    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(h.provider.create_calls(), 3);
    assert_eq!(job.history().len(), 6);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn quota_exceeded_fails_immediately() -> TestResult {
    init_tracing();
    let h = DispatcherBuilder::new()
        .with_policy(DispatchPolicy::default())
        .with_provider(ScriptedProvider::new().with_create(CreateScript::QuotaExceeded))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.reason(), Some(FailureReason::QuotaExceeded));
    assert_eq!(h.provider.create_calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    // No environment was created, so there is nothing to terminate.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.provider.terminate_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unauthorized_provider_is_fatal() -> TestResult {
    init_tracing();
    let h = DispatcherBuilder::new()
        .with_policy(DispatchPolicy::default())
        .with_provider(ScriptedProvider::new().with_create(CreateScript::Unauthorized))
        .build();
    let artifact = h.upload("alice");

    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.reason(), Some(FailureReason::Unauthorized));
    assert_eq!(h.provider.create_calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hanging_create_counts_as_unavailable() -> TestResult {
    init_tracing();
    let policy = DispatchPolicy::default();
    let h = DispatcherBuilder::new()
        .with_policy(policy)
        .with_provider(ScriptedProvider::new().with_create(CreateScript::Hang))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.reason(), Some(FailureReason::ProviderUnavailable));
    assert_eq!(h.provider.create_calls(), policy.provision_retry.max_attempts);

    // Five 30s request timeouts plus 1s + 2s + 4s + 8s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(165));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unbounded_provision_timeout_still_polls_to_ready() -> TestResult {
    init_tracing();
    let h = DispatcherBuilder::new()
        .with_policy(DispatchPolicy {
            provision_timeout: Duration::MAX,
            ..DispatchPolicy::default()
        })
        .with_provider(ScriptedProvider::new().with_ready(ReadyScript::AfterPolls(3)))
        .build();
    let artifact = h.upload("alice");

    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(h.provider.poll_calls(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn never_ready_environment_times_out_after_provision_timeout_not_before() -> TestResult {
    init_tracing();
    let policy = DispatchPolicy::default();
    let h = DispatcherBuilder::new()
        .with_policy(policy)
        .with_provider(ScriptedProvider::new().with_ready(ReadyScript::Never))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;

    tokio::time::sleep(policy.provision_timeout - Duration::from_secs(1)).await;
    let job = h.dispatcher.get(&id).ok_or("job vanished")?;
    assert_eq!(job.state(), JobState::Provisioning);

    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;
    assert_eq!(job.reason(), Some(FailureReason::ProvisionTimeout));
    assert!(started.elapsed() >= policy.provision_timeout);
    assert!(h.provider.poll_calls() > 1);
    assert_valid_path(&job);

    // The environment was created, so it is released.
    h.provider.wait_for_terminations(1).await;
    assert_eq!(h.provider.terminate_calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_start_times_out() -> TestResult {
    init_tracing();
    let policy = DispatchPolicy::default();
    let h = DispatcherBuilder::new()
        .with_policy(policy)
        .with_provider(ScriptedProvider::new().with_start(StartScript::Hang))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.reason(), Some(FailureReason::StartTimeout));
    assert_eq!(states(&job).last(), Some(&JobState::Failed));
    assert!(states(&job).contains(&JobState::Starting));
    assert!(started.elapsed() >= policy.start_timeout);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_process_is_unresponsive_after_run_window() -> TestResult {
    init_tracing();
    let policy = DispatchPolicy {
        run_window: Duration::from_secs(90),
        ..DispatchPolicy::default()
    };
    let h = DispatcherBuilder::new()
        .with_policy(policy)
        .with_provider(ScriptedProvider::new().with_run(RunScript::Silent))
        .build();
    let artifact = h.upload("alice");

    let started = Instant::now();
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let job = h.dispatcher.wait(&id).await.ok_or("job vanished")?;

    assert_eq!(job.reason(), Some(FailureReason::Unresponsive));
    assert!(states(&job).contains(&JobState::Running));
    assert!(started.elapsed() >= Duration::from_secs(90));
    Ok(())
}
