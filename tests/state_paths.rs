// tests/state_paths.rs

mod common;
use crate::common::{
    assert_valid_path, CreateScript, DispatcherBuilder, ReadyScript, RunScript, ScriptedProvider,
    StartScript, TransferScript,
};

use proptest::prelude::*;

use launchpad::engine::{DispatchPolicy, Job};
use launchpad::types::JobState;

fn create_script() -> impl Strategy<Value = CreateScript> {
    prop_oneof![
        Just(CreateScript::Succeed),
        Just(CreateScript::AlwaysUnavailable),
        (0u32..6).prop_map(CreateScript::UnavailableTimes),
        Just(CreateScript::QuotaExceeded),
        Just(CreateScript::Unauthorized),
        Just(CreateScript::Hang),
    ]
}

fn ready_script() -> impl Strategy<Value = ReadyScript> {
    prop_oneof![
        Just(ReadyScript::Immediately),
        (0u32..5).prop_map(ReadyScript::AfterPolls),
        Just(ReadyScript::Never),
        Just(ReadyScript::Failed),
    ]
}

fn transfer_script() -> impl Strategy<Value = TransferScript> {
    prop_oneof![
        Just(TransferScript::Succeed),
        (0u32..4).prop_map(TransferScript::FailTimes),
        Just(TransferScript::AlwaysFail),
    ]
}

fn start_script() -> impl Strategy<Value = StartScript> {
    prop_oneof![
        Just(StartScript::Succeed),
        Just(StartScript::Fail),
        Just(StartScript::Hang),
    ]
}

fn run_script() -> impl Strategy<Value = RunScript> {
    prop_oneof![
        (-2i32..3).prop_map(RunScript::Exit),
        Just(RunScript::HealthCheckFailed("health endpoint down".to_string())),
        Just(RunScript::Silent),
    ]
}

/// Run one job to completion on a paused clock and return its final record.
fn run_scripted(provider: ScriptedProvider) -> Job {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let h = DispatcherBuilder::new()
            .with_policy(DispatchPolicy::default())
            .with_provider(provider)
            .build();
        let artifact = h.upload("alice");
        let id = h
            .dispatcher
            .submit("alice", artifact.hash.as_str(), "./run.sh")
            .unwrap();
        h.dispatcher.wait(&id).await.unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_job_follows_a_legal_path_to_a_terminal_state(
        create in create_script(),
        ready in ready_script(),
        transfer in transfer_script(),
        start in start_script(),
        run in run_script(),
    ) {
        let provider = ScriptedProvider::new()
            .with_create(create)
            .with_ready(ready)
            .with_transfer(transfer)
            .with_start(start)
            .with_run(run.clone());

        let job = run_scripted(provider);
        assert_valid_path(&job);
        prop_assert!(job.is_terminal());

        // Five create attempts and three transfer attempts by default.
        let creates = match create {
            CreateScript::Succeed => true,
            CreateScript::UnavailableTimes(n) => n < 5,
            _ => false,
        };
        let transfers = match transfer {
            TransferScript::Succeed => true,
            TransferScript::FailTimes(n) => n < 3,
            TransferScript::AlwaysFail => false,
        };
        let happy = creates
            && matches!(ready, ReadyScript::Immediately | ReadyScript::AfterPolls(_))
            && transfers
            && start == StartScript::Succeed
            && run == RunScript::Exit(0);

        prop_assert_eq!(job.state() == JobState::Completed, happy);
        prop_assert_eq!(job.reason().is_none(), job.state() == JobState::Completed);
    }
}
