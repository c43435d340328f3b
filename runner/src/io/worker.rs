//! Attempt worker adapter.
//!
//! One attempt is one worker process: the rendered attempt prompt goes in on
//! stdin, every output line is streamed into the transcript, and the line
//! stream doubles as the heartbeat. Exit code 0 means the worker is asking
//! for the verification gate; any non-zero exit is a worker error.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::conversation::ConversationLog;

/// How often the attempt loop re-checks the heartbeat and the cancel flag.
const WAIT_TICK: Duration = Duration::from_millis(200);

/// Parameters for running one attempt to completion.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    /// Rendered attempt prompt, fed to the worker on stdin.
    pub prompt: String,
    /// Silence longer than this kills the worker and reports a stall.
    pub heartbeat: Duration,
    /// Set by the control watcher on operator stop.
    pub cancel: Arc<AtomicBool>,
}

/// How the attempt ended, as observed by the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEnd {
    /// Worker exited 0: it considers the goal reached and wants the gate.
    VerifyRequested,
    /// No output within the heartbeat window; the worker was killed.
    Stalled,
    /// Worker exited non-zero before requesting verification.
    Errored { exit_code: Option<i32> },
    /// Operator stop killed the worker mid-attempt.
    Cancelled,
}

/// Abstraction over the worker session so the supervisor loop is testable
/// without spawning real agent processes.
pub trait WorkerRunner {
    fn run(&self, request: &AttemptRequest, transcript: &mut ConversationLog)
    -> Result<AttemptEnd>;
}

/// Worker implementation spawning the configured command.
pub struct ProcessWorkerRunner;

impl WorkerRunner for ProcessWorkerRunner {
    #[instrument(skip_all, fields(heartbeat_secs = request.heartbeat.as_secs()))]
    fn run(
        &self,
        request: &AttemptRequest,
        transcript: &mut ConversationLog,
    ) -> Result<AttemptEnd> {
        let program = request
            .command
            .first()
            .ok_or_else(|| anyhow!("worker command must not be empty"))?;

        info!(command = ?request.command, "starting attempt worker");
        let mut child = Command::new(program)
            .args(&request.command[1..])
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn worker {program}"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A worker that ignores stdin may close its end before the prompt
        // lands; that is not an attempt failure.
        if let Err(err) = stdin.write_all(request.prompt.as_bytes())
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(err).context("write attempt prompt to worker stdin");
        }
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let (tx, rx) = mpsc::channel::<String>();
        let stdout_handle = spawn_line_reader(stdout, tx.clone(), None);
        let stderr_handle = spawn_line_reader(stderr, tx, Some("[stderr] "));

        let mut last_activity = Instant::now();
        let status = loop {
            // Any output line counts as a heartbeat.
            while let Ok(line) = rx.try_recv() {
                transcript.append_line(&line)?;
                last_activity = Instant::now();
            }
            if request.cancel.load(Ordering::SeqCst) {
                warn!("attempt cancelled, killing worker");
                child.kill().context("kill worker")?;
                child.wait().context("wait worker after cancel")?;
                drain_remaining(&rx, transcript)?;
                join_reader(stdout_handle);
                join_reader(stderr_handle);
                return Ok(AttemptEnd::Cancelled);
            }
            if last_activity.elapsed() >= request.heartbeat {
                warn!(
                    silent_secs = last_activity.elapsed().as_secs(),
                    "heartbeat stall, killing worker"
                );
                child.kill().context("kill stalled worker")?;
                child.wait().context("wait worker after stall kill")?;
                drain_remaining(&rx, transcript)?;
                join_reader(stdout_handle);
                join_reader(stderr_handle);
                return Ok(AttemptEnd::Stalled);
            }
            match child.wait_timeout(WAIT_TICK).context("wait for worker")? {
                Some(status) => break status,
                None => continue,
            }
        };

        join_reader(stdout_handle);
        join_reader(stderr_handle);
        drain_remaining(&rx, transcript)?;

        debug!(exit_code = ?status.code(), "worker exited");
        if status.success() {
            Ok(AttemptEnd::VerifyRequested)
        } else {
            Ok(AttemptEnd::Errored {
                exit_code: status.code(),
            })
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: mpsc::Sender<String>,
    prefix: Option<&'static str>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            let Ok(line) = line else { break };
            let line = match prefix {
                Some(p) => format!("{p}{line}"),
                None => line,
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

fn drain_remaining(rx: &mpsc::Receiver<String>, transcript: &mut ConversationLog) -> Result<()> {
    while let Ok(line) = rx.try_recv() {
        transcript.append_line(&line)?;
    }
    Ok(())
}

fn join_reader(handle: thread::JoinHandle<()>) {
    let _ = handle.join();
}
