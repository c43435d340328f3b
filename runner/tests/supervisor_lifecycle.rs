//! End-to-end supervisor lifecycle over a real `.rlm/` workspace, with
//! scripted worker and gate backends.

use std::fs;
use std::thread;
use std::time::Duration;

use rlm_runner::core::supervisor::Phase;
use rlm_runner::io::control::{ControlFlags, load_control, write_control};
use rlm_runner::io::state::load_supervisor_state;
use rlm_runner::io::worker::AttemptEnd;
use rlm_runner::supervise::run_supervisor;
use rlm_runner::test_support::{ScriptedVerifier, ScriptedWorkerRunner, TestWorkspace};

#[test]
fn fail_fail_pass_run_leaves_a_full_audit_trail() {
    let ws = TestWorkspace::init();
    let worker = ScriptedWorkerRunner::new(vec![
        AttemptEnd::VerifyRequested,
        AttemptEnd::VerifyRequested,
        AttemptEnd::VerifyRequested,
    ]);
    let verifier = ScriptedVerifier::new(vec![
        ScriptedVerifier::failing("expected 4, got 5"),
        ScriptedVerifier::failing("expected 4, got 3"),
        ScriptedVerifier::passing(),
    ]);

    let outcome = run_supervisor(ws.root(), &ws.config(), &worker, &verifier).expect("run");
    assert_eq!(outcome.phase, Phase::Passed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.verified_failures, 2);

    // Every attempt left its metadata behind.
    for seq in 1..=3 {
        let meta = fs::read_to_string(ws.root().join(format!(".rlm/attempts/{seq}/meta.json")))
            .expect("meta");
        assert!(meta.contains(&format!("\"seq\": {seq}")));
    }

    // The final attempt's context carried the second failure, not the first.
    let failure =
        fs::read_to_string(ws.root().join(".rlm/context/failure.md")).expect("failure context");
    assert!(failure.contains("expected 4, got 3"));
    assert!(!failure.contains("expected 4, got 5"));

    let state = load_supervisor_state(&ws.paths.supervisor_path)
        .expect("load")
        .expect("state");
    assert_eq!(state.phase, Phase::Passed);
    assert!(state.attempts[2].verification.as_ref().expect("record").passed);
}

#[test]
fn exhausted_run_reports_every_rollover_cause() {
    let ws = TestWorkspace::init();
    let mut config = ws.config();
    config.max_attempts = 3;
    let worker = ScriptedWorkerRunner::new(vec![
        AttemptEnd::Stalled,
        AttemptEnd::Errored { exit_code: Some(2) },
        AttemptEnd::VerifyRequested,
    ]);
    let verifier = ScriptedVerifier::new(vec![ScriptedVerifier::failing("still broken")]);

    let outcome = run_supervisor(ws.root(), &config, &worker, &verifier).expect("run");
    assert_eq!(outcome.phase, Phase::FailedExhausted);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.stall_rollovers, 1);
    assert_eq!(outcome.worker_errors, 1);
    assert_eq!(outcome.verified_failures, 1);
}

#[test]
fn pause_blocks_scheduling_until_resume() {
    let ws = TestWorkspace::init();
    write_control(
        &ws.paths.control_path,
        &ControlFlags {
            paused: true,
            stop: false,
        },
    )
    .expect("pause");

    let root = ws.root().to_path_buf();
    let config = ws.config();
    let handle = thread::spawn(move || {
        let worker = ScriptedWorkerRunner::new(vec![AttemptEnd::VerifyRequested]);
        let verifier = ScriptedVerifier::new(vec![ScriptedVerifier::passing()]);
        run_supervisor(&root, &config, &worker, &verifier).expect("run")
    });

    // The loop parks without scheduling while paused.
    thread::sleep(Duration::from_millis(800));
    let state = load_supervisor_state(&ws.paths.supervisor_path)
        .expect("load")
        .expect("state");
    assert!(state.paused);
    assert!(state.attempts.is_empty());

    let mut flags = load_control(&ws.paths.control_path).expect("control");
    flags.paused = false;
    write_control(&ws.paths.control_path, &flags).expect("resume");

    let outcome = handle.join().expect("join");
    assert_eq!(outcome.phase, Phase::Passed);
    assert_eq!(outcome.attempts, 1);
}

#[test]
fn stop_during_run_aborts_promptly() {
    let ws = TestWorkspace::init();
    write_control(
        &ws.paths.control_path,
        &ControlFlags {
            paused: true,
            stop: false,
        },
    )
    .expect("pause first");

    let root = ws.root().to_path_buf();
    let config = ws.config();
    let handle = thread::spawn(move || {
        let worker = ScriptedWorkerRunner::new(vec![AttemptEnd::VerifyRequested]);
        let verifier = ScriptedVerifier::new(vec![ScriptedVerifier::passing()]);
        run_supervisor(&root, &config, &worker, &verifier).expect("run")
    });

    thread::sleep(Duration::from_millis(400));
    write_control(
        &ws.paths.control_path,
        &ControlFlags {
            paused: true,
            stop: true,
        },
    )
    .expect("stop");

    let outcome = handle.join().expect("join");
    assert_eq!(outcome.phase, Phase::Aborted);
    assert_eq!(outcome.attempts, 0);
}

#[test]
fn long_transcript_is_archived_not_discarded() {
    let ws = TestWorkspace::init();
    let mut config = ws.config();
    config.max_conversation_lines = 20;
    config.conversation_archive_count = 2;
    let mut worker = ScriptedWorkerRunner::new(vec![AttemptEnd::VerifyRequested]);
    worker.transcript_lines_per_attempt = 50;
    let verifier = ScriptedVerifier::new(vec![ScriptedVerifier::passing()]);

    run_supervisor(ws.root(), &config, &worker, &verifier).expect("run");

    let archive_dir = ws.root().join(".rlm/attempts/1/transcript-archives");
    let archives = fs::read_dir(&archive_dir).expect("archives").count();
    assert!(archives >= 1);
    assert!(archives <= 2);

    let state = load_supervisor_state(&ws.paths.supervisor_path)
        .expect("load")
        .expect("state");
    assert!(state.conversation_archives >= 1);
    assert!(state.conversation_lines <= 20);
}
