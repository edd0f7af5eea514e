// tests/journal_replay.rs

mod common;
use crate::common::{init_tracing, with_timeout, DispatcherBuilder, RunScript, ScriptedProvider};

use std::error::Error;
use std::io::Write;

use launchpad::tracker::StatusTracker;
use launchpad::types::{FailureReason, JobState};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn finished_jobs_survive_a_restart() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state").join("jobs.jsonl");

    let h = DispatcherBuilder::new()
        .with_tracker(StatusTracker::open(&path)?)
        .build();
    let artifact = h.upload("alice");
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    let before = with_timeout(h.dispatcher.wait(&id)).await.ok_or("job vanished")?;
    assert_eq!(before.state(), JobState::Completed);

    let reopened = StatusTracker::open(&path)?;
    let after = reopened.get(&id).ok_or("job missing after replay")?;
    assert_eq!(after, before);
    assert_eq!(after.history().len(), 6);
    assert_eq!(reopened.list("alice").len(), 1);
    Ok(())
}

#[tokio::test]
async fn in_flight_jobs_are_marked_interrupted_on_replay() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jobs.jsonl");

    let h = DispatcherBuilder::new()
        .with_provider(ScriptedProvider::new().with_run(RunScript::Hold))
        .with_tracker(StatusTracker::open(&path)?)
        .build();
    let artifact = h.upload("alice");
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    with_timeout(h.dispatcher.tracker().wait_for_state(&id, JobState::Running)).await;

    let replayed = StatusTracker::open(&path)?;
    let job = replayed.get(&id).ok_or("job missing after replay")?;
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.reason(), Some(FailureReason::Interrupted));
    assert_eq!(job.history().len(), 6);

    // The interruption is journalled, so a third open sees it too.
    let third = StatusTracker::open(&path)?;
    assert_eq!(
        third.get(&id).map(|j| j.reason()),
        Some(Some(FailureReason::Interrupted))
    );

    h.provider.release(0);
    Ok(())
}

#[tokio::test]
async fn environments_of_interrupted_jobs_are_released_once() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jobs.jsonl");

    let h = DispatcherBuilder::new()
        .with_provider(ScriptedProvider::new().with_run(RunScript::Hold))
        .with_tracker(StatusTracker::open(&path)?)
        .build();
    let artifact = h.upload("alice");
    let id = h.dispatcher.submit("alice", artifact.hash.as_str(), "./run.sh")?;
    with_timeout(h.dispatcher.tracker().wait_for_state(&id, JobState::Running)).await;

    let restarted = DispatcherBuilder::new()
        .with_tracker(StatusTracker::open(&path)?)
        .build();
    assert_eq!(restarted.dispatcher.reclaim_orphaned_environments().await, 1);
    assert_eq!(restarted.provider.terminate_calls(), 1);
    assert_eq!(restarted.dispatcher.reclaim_orphaned_environments().await, 0);

    // Already failed on the previous replay: nothing left to release.
    let again = StatusTracker::open(&path)?;
    assert!(again.take_orphaned_environments().is_empty());

    h.provider.release(0);
    Ok(())
}

#[test]
fn unreadable_journal_lines_are_skipped() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jobs.jsonl");

    {
        let mut f = std::fs::File::create(&path)?;
        writeln!(f, "{{\"not\": \"a job\"}}")?;
        writeln!(f, "garbage")?;
    }

    let tracker = StatusTracker::open(&path)?;
    assert!(tracker.is_empty());
    Ok(())
}
