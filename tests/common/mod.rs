#![allow(dead_code)]

pub use launchpad_test_utils::*;

use launchpad::engine::Job;
use launchpad::types::JobState;

/// The states a job went through, in order.
pub fn states(job: &Job) -> Vec<JobState> {
    job.history().iter().map(|h| h.state).collect()
}

/// Every consecutive pair in the history is a legal transition, the first
/// entry is `Queued` and only the last entry may be terminal.
pub fn assert_valid_path(job: &Job) {
    let states = states(job);
    assert_eq!(states.first(), Some(&JobState::Queued), "history: {states:?}");
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal step {} -> {} in {states:?}",
            pair[0],
            pair[1]
        );
    }
    let terminal = states.iter().filter(|s| s.is_terminal()).count();
    assert!(terminal <= 1, "more than one terminal entry: {states:?}");
    if terminal == 1 {
        assert!(states.last().is_some_and(|s| s.is_terminal()));
    }
}
