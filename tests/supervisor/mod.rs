//! Supervisor module tests.

mod runner_test;

/// Verify all public supervisor types are exported from the library.
#[test]
fn test_all_supervisor_types_exported() {
    use jobrunner::supervisor::{
        JobOutcome, JobState, JobStatus, PromptMatcher, SpawnError, StatusNotifier,
        SupervisorError, Utf8Decoder, RC_NOT_FOUND, RC_TIMEOUT,
    };

    let _ = JobState::new();
    let _ = StatusNotifier::new("job");
    let _ = Utf8Decoder::new();
    assert!(PromptMatcher::new(&[]).unwrap().is_empty());

    let _: fn() -> SpawnError = || SpawnError::EmptyCommand;
    let _: fn() -> SupervisorError = || SupervisorError::Callback("cancel", "x".into());

    let outcome = JobOutcome {
        status: JobStatus::Timeout,
        rc: RC_TIMEOUT,
    };
    assert!(outcome.status.is_terminal());
    assert_ne!(RC_NOT_FOUND, RC_TIMEOUT);
}
