//! Verification gate adapter.
//!
//! The gate is an external command invoked with no stdin; exit code 0 means
//! pass, any non-zero means fail, and a timeout is a distinct outcome.
//! Cancellation (operator abort) kills the child process, never abandons it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::supervisor::VerificationRecord;

/// How often the gate loop re-checks the deadline and the cancel flag.
const WAIT_TICK: Duration = Duration::from_millis(200);

/// Bytes of captured output attached inline to the verification record.
const EXCERPT_LIMIT: usize = 4_000;

/// Raised when an operator abort cancelled an in-flight verification.
#[derive(Debug, Clone, Copy)]
pub struct VerifyCancelledError;

impl fmt::Display for VerifyCancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "verification cancelled by operator stop")
    }
}

impl std::error::Error for VerifyCancelledError {}

/// Parameters for one gate invocation.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Set by the control watcher on operator stop.
    pub cancel: Arc<AtomicBool>,
}

/// Abstraction over the verification gate.
pub trait VerifyRunner {
    fn run(&self, request: &VerifyRequest) -> Result<VerificationRecord>;
}

/// Gate implementation spawning the configured command.
pub struct CommandVerifier;

impl VerifyRunner for CommandVerifier {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &VerifyRequest) -> Result<VerificationRecord> {
        let start = Instant::now();
        let program = request
            .command
            .first()
            .ok_or_else(|| anyhow!("verify command must not be empty"))?;

        info!(command = ?request.command, workdir = %request.workdir.display(), "running verification gate");
        let mut child = Command::new(program)
            .args(&request.command[1..])
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn verification gate {program}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let limit = request.output_limit_bytes;
        let stdout_handle = thread::spawn(move || drain_limited(stdout, limit));
        let stderr_handle = thread::spawn(move || drain_limited(stderr, limit));

        let deadline = start + request.timeout;
        let mut timed_out = false;
        let status = loop {
            if request.cancel.load(Ordering::SeqCst) {
                warn!("verification cancelled, killing gate process");
                child.kill().context("kill gate process")?;
                child.wait().context("wait gate process after cancel")?;
                join_drain(stdout_handle);
                join_drain(stderr_handle);
                return Err(anyhow!(VerifyCancelledError));
            }
            if Instant::now() >= deadline {
                warn!(timeout_secs = request.timeout.as_secs(), "verification timed out, killing");
                timed_out = true;
                child.kill().context("kill gate process")?;
                break child.wait().context("wait gate process after kill")?;
            }
            match child.wait_timeout(WAIT_TICK).context("wait for gate")? {
                Some(status) => break status,
                None => continue,
            }
        };

        let stdout = join_drain(stdout_handle);
        let stderr = join_drain(stderr_handle);
        let log = render_log(&stdout, &stderr, timed_out);
        write_gate_log(&request.log_path, &log)?;

        let passed = !timed_out && status.success();
        let record = VerificationRecord {
            passed,
            exit_code: status.code(),
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
            log_path: Some(request.log_path.display().to_string()),
            output_excerpt: excerpt(&log),
        };
        debug!(passed, timed_out, exit_code = ?record.exit_code, "gate finished");
        Ok(record)
    }
}

fn drain_limited<R: std::io::Read>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let remaining = limit.saturating_sub(buf.len());
                if remaining > 0 {
                    buf.extend_from_slice(&chunk[..n.min(remaining)]);
                }
            }
        }
    }
    buf
}

fn join_drain(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

fn render_log(stdout: &[u8], stderr: &[u8], timed_out: bool) -> String {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(stderr));
    if timed_out {
        buf.push_str("\n[verification timed out]\n");
    }
    buf
}

fn write_gate_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write gate log {}", path.display()))
}

fn excerpt(log: &str) -> String {
    if log.len() <= EXCERPT_LIMIT {
        return log.to_string();
    }
    let mut end = EXCERPT_LIMIT;
    while !log.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[excerpt truncated]", &log[..end])
}
