//! The supervisor loop: schedules attempts, runs the verification gate, and
//! applies operator control, persisting state across every transition.
//!
//! The loop owns no policy of its own; all transitions go through the pure
//! state machine in [`crate::core::supervisor`]. A control watcher thread
//! polls `.rlm/state/control.json` so an operator stop reaches a running
//! worker or gate promptly, while pause only takes effect between attempts.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::supervisor::{Phase, SupervisorState};
use crate::io::artifacts::{load_artifacts, write_attempt_context};
use crate::io::config::RunnerConfig;
use crate::io::control::load_control;
use crate::io::conversation::ConversationLog;
use crate::io::init::RunnerPaths;
use crate::io::prompt::{AttemptPromptInputs, render_attempt_prompt};
use crate::io::state::{AttemptPaths, load_supervisor_state, write_attempt_meta, write_supervisor_state};
use crate::io::verify::{VerifyCancelledError, VerifyRequest, VerifyRunner};
use crate::io::worker::{AttemptEnd, AttemptRequest, WorkerRunner};

/// How often the loop and the control watcher re-read the control flags.
const CONTROL_POLL: Duration = Duration::from_millis(250);

/// Final state of a supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub phase: Phase,
    pub attempts: u32,
    pub stall_rollovers: u32,
    pub verified_failures: u32,
    pub worker_errors: u32,
}

impl SupervisorOutcome {
    fn from_state(state: &SupervisorState) -> Self {
        Self {
            phase: state.phase,
            attempts: state.attempts.len() as u32,
            stall_rollovers: state.stall_rollovers,
            verified_failures: state.verified_failures,
            worker_errors: state.worker_errors,
        }
    }
}

/// Run the retry loop until a terminal phase is reached.
///
/// An existing non-terminal `supervisor.json` is resumed; a terminal one is
/// replaced by a fresh run.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_supervisor<W, V>(
    root: &Path,
    config: &RunnerConfig,
    worker: &W,
    verifier: &V,
) -> Result<SupervisorOutcome>
where
    W: WorkerRunner,
    V: VerifyRunner,
{
    let paths = RunnerPaths::new(root);
    let artifacts = load_artifacts(root)?;
    let mut state = match load_supervisor_state(&paths.supervisor_path)? {
        Some(mut existing) if !existing.phase.is_terminal() => {
            info!(phase = existing.phase.as_str(), "resuming persisted supervisor state");
            // A restart while an attempt was active means its worker is
            // gone; roll the attempt over so the loop can schedule again.
            if let Some(seq) = existing.recover_interrupted() {
                warn!(attempt = seq, cause = "interrupted", "attempt rolled over");
                write_supervisor_state(&paths.supervisor_path, &existing)?;
            }
            existing
        }
        _ => SupervisorState::new(config.max_attempts),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let watcher_done = Arc::new(AtomicBool::new(false));
    let watcher = spawn_control_watcher(
        paths.control_path.clone(),
        cancel.clone(),
        watcher_done.clone(),
    );

    let result = supervise_loop(root, config, worker, verifier, &paths, &artifacts, &mut state, &cancel);

    watcher_done.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    write_supervisor_state(&paths.supervisor_path, &state)?;
    result?;
    Ok(SupervisorOutcome::from_state(&state))
}

#[allow(clippy::too_many_arguments)]
fn supervise_loop<W, V>(
    root: &Path,
    config: &RunnerConfig,
    worker: &W,
    verifier: &V,
    paths: &RunnerPaths,
    artifacts: &crate::io::artifacts::ArtifactSet,
    state: &mut SupervisorState,
    cancel: &Arc<AtomicBool>,
) -> Result<()>
where
    W: WorkerRunner,
    V: VerifyRunner,
{
    loop {
        let flags = load_control(&paths.control_path)?;
        if flags.stop || cancel.load(Ordering::SeqCst) {
            if !state.phase.is_terminal() {
                warn!("operator stop, aborting run");
                state.abort()?;
                write_supervisor_state(&paths.supervisor_path, state)?;
            }
            return Ok(());
        }
        if state.phase.is_terminal() {
            info!(phase = state.phase.as_str(), attempts = state.attempts.len(), "run finished");
            return Ok(());
        }
        if flags.paused != state.paused {
            if flags.paused {
                info!("operator pause, scheduling blocked");
                state.pause()?;
            } else {
                info!("operator resume");
                state.resume()?;
            }
            write_supervisor_state(&paths.supervisor_path, state)?;
        }
        if !state.can_schedule() {
            thread::sleep(CONTROL_POLL);
            continue;
        }

        run_attempt(root, config, worker, verifier, paths, artifacts, state, cancel)?;
    }
}

/// Run one attempt end-to-end: seed context, run the worker, and apply its
/// outcome (gate run included) to the state machine.
#[allow(clippy::too_many_arguments)]
fn run_attempt<W, V>(
    root: &Path,
    config: &RunnerConfig,
    worker: &W,
    verifier: &V,
    paths: &RunnerPaths,
    artifacts: &crate::io::artifacts::ArtifactSet,
    state: &mut SupervisorState,
    cancel: &Arc<AtomicBool>,
) -> Result<()>
where
    W: WorkerRunner,
    V: VerifyRunner,
{
    // Rollover carries only the last verification excerpt forward.
    let failure = state
        .last_verification()
        .filter(|v| !v.passed)
        .map(|v| v.output_excerpt.clone());

    let seq = state.begin_attempt()?;
    write_supervisor_state(&paths.supervisor_path, state)?;
    info!(attempt = seq, rollover = failure.is_some(), "attempt started");

    write_attempt_context(root, artifacts, failure.as_deref())?;
    // Each attempt gets a fresh context session; stale snapshots from the
    // previous attempt's worker are dropped.
    if paths.session_path.exists() {
        std::fs::remove_file(&paths.session_path).context("clear session state")?;
    }
    let attempt_paths = AttemptPaths::new(root, seq);
    attempt_paths.create()?;

    let prompt = render_attempt_prompt(&AttemptPromptInputs {
        seq,
        goal: &artifacts.goal,
        plan: &artifacts.plan,
        rules: &artifacts.rules,
        failure: failure.as_deref(),
    })?;
    let mut transcript = ConversationLog::open(
        &attempt_paths.transcript_path,
        &attempt_paths.transcript_archive_dir,
        config.max_conversation_lines,
        config.conversation_archive_count,
    )?;

    let end = worker.run(
        &AttemptRequest {
            command: config.worker.command.clone(),
            workdir: root.to_path_buf(),
            prompt,
            heartbeat: config.heartbeat(),
            cancel: cancel.clone(),
        },
        &mut transcript,
    )?;
    state.record_conversation(transcript.lines() as u64, transcript.archives()? as u32);

    match end {
        AttemptEnd::VerifyRequested => {
            state.request_verification()?;
            write_supervisor_state(&paths.supervisor_path, state)?;
            run_gate(root, config, verifier, seq, &attempt_paths, state, cancel)?;
        }
        AttemptEnd::Stalled => {
            warn!(attempt = seq, cause = "heartbeat-stall", "attempt rolled over");
            state.record_stall()?;
        }
        AttemptEnd::Errored { exit_code } => {
            warn!(attempt = seq, cause = "worker-error", ?exit_code, "attempt rolled over");
            state.record_worker_error()?;
        }
        AttemptEnd::Cancelled => {
            warn!(attempt = seq, "attempt cancelled by operator stop");
            state.abort()?;
        }
    }

    if let Some(attempt) = state.attempts.last() {
        write_attempt_meta(&attempt_paths, attempt)?;
    }
    write_supervisor_state(&paths.supervisor_path, state)
        .context("persist supervisor state after attempt")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_gate<V>(
    root: &Path,
    config: &RunnerConfig,
    verifier: &V,
    seq: u32,
    attempt_paths: &AttemptPaths,
    state: &mut SupervisorState,
    cancel: &Arc<AtomicBool>,
) -> Result<()>
where
    V: VerifyRunner,
{
    let workdir = match &config.verify.workdir {
        Some(dir) => {
            let dir = Path::new(dir);
            if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                root.join(dir)
            }
        }
        None => root.to_path_buf(),
    };

    let outcome = verifier.run(&VerifyRequest {
        command: config.verify.command.clone(),
        workdir,
        log_path: attempt_paths.verify_log_path.clone(),
        timeout: config.verify_timeout(),
        output_limit_bytes: config.output_limit_bytes,
        cancel: cancel.clone(),
    });

    match outcome {
        Ok(record) => {
            if record.passed {
                info!(attempt = seq, exit_code = ?record.exit_code, "verification passed");
            } else {
                warn!(
                    attempt = seq,
                    cause = if record.timed_out { "verification-timeout" } else { "verification-failed" },
                    exit_code = ?record.exit_code,
                    log = ?record.log_path,
                    "attempt rolled over"
                );
            }
            state.record_verification(record)?;
            Ok(())
        }
        Err(err) if err.downcast_ref::<VerifyCancelledError>().is_some() => {
            warn!("verification cancelled by operator stop");
            state.abort()?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn spawn_control_watcher(
    control_path: std::path::PathBuf,
    cancel: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if let Ok(flags) = load_control(&control_path)
                && flags.stop
            {
                cancel.store(true, Ordering::SeqCst);
                return;
            }
            thread::sleep(CONTROL_POLL);
        }
    })
}
