//! Pure attempt-supervisor state machine.
//!
//! All control-loop state transitions funnel through [`SupervisorState`];
//! the I/O loop in [`crate::supervise`] only decides *when* to call them.
//! Keeping the machine pure makes exhaustion, rollover, and pause semantics
//! testable without processes or timers.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Supervisor phase. `Passed`, `FailedExhausted`, and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Running,
    AwaitingVerification,
    Passed,
    FailedRetry,
    FailedExhausted,
    Stalled,
    Paused,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Passed | Phase::FailedExhausted | Phase::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::AwaitingVerification => "awaiting-verification",
            Phase::Passed => "passed",
            Phase::FailedRetry => "failed-retry",
            Phase::FailedExhausted => "failed-exhausted",
            Phase::Stalled => "stalled",
            Phase::Paused => "paused",
            Phase::Aborted => "aborted",
        }
    }
}

/// Why an attempt was rolled over into a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloverCause {
    VerificationFailed,
    VerificationTimeout,
    HeartbeatStall,
    WorkerError,
    /// The supervisor process died mid-attempt and found the attempt still
    /// marked active on restart.
    Interrupted,
}

impl RolloverCause {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloverCause::VerificationFailed => "verification-failed",
            RolloverCause::VerificationTimeout => "verification-timeout",
            RolloverCause::HeartbeatStall => "heartbeat-stall",
            RolloverCause::WorkerError => "worker-error",
            RolloverCause::Interrupted => "interrupted",
        }
    }
}

/// Outcome of running the verification gate for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// True iff the gate process exited with code 0.
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Timeouts are reported distinctly from non-zero exits.
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Path of the captured stdout/stderr log, when one was written.
    pub log_path: Option<String>,
    /// Truncated captured output for quick diagnosis.
    pub output_excerpt: String,
}

/// Per-attempt status. Terminal once it leaves `Running`/`AwaitingVerification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Running,
    AwaitingVerification,
    Passed,
    Failed,
    Stalled,
    Aborted,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Running | AttemptStatus::AwaitingVerification)
    }
}

/// One worker execution cycle. Immutable once its status is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-indexed, strictly increasing, never exceeds `max_attempts`.
    pub seq: u32,
    pub status: AttemptStatus,
    /// Present iff the attempt reached the verification phase.
    pub verification: Option<VerificationRecord>,
    pub rollover: Option<RolloverCause>,
}

/// Raised when no further attempt may be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptsExhaustedError {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl fmt::Display for AttemptsExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempts exhausted ({}/{}); external intervention required",
            self.attempts, self.max_attempts
        )
    }
}

impl std::error::Error for AttemptsExhaustedError {}

/// Raised on a transition the current phase does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransitionError {
    pub phase: Phase,
    pub action: &'static str,
}

impl fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {}", self.action, self.phase.as_str())
    }
}

impl std::error::Error for InvalidTransitionError {}

/// Process-wide control state for one goal's retry loop.
///
/// This is the only shared mutable state of the control loop; sub-agents and
/// dispatch calls report results upward and never touch it directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub phase: Phase,
    pub max_attempts: u32,
    pub attempts: Vec<Attempt>,
    /// Rollovers forced by heartbeat stalls, counted separately from
    /// verification-driven retries.
    pub stall_rollovers: u32,
    /// Rollovers driven by a failed or timed-out verification.
    pub verified_failures: u32,
    /// Rollovers caused by the worker process erroring before verification.
    pub worker_errors: u32,
    /// Line count of the active session's transcript.
    pub conversation_lines: u64,
    /// Archive files produced by conversation trimming.
    pub conversation_archives: u32,
    pub paused: bool,
    /// Phase to restore on resume; also the effective phase while paused.
    pub resume_phase: Option<Phase>,
}

impl SupervisorState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            phase: Phase::Idle,
            max_attempts,
            attempts: Vec::new(),
            stall_rollovers: 0,
            verified_failures: 0,
            worker_errors: 0,
            conversation_lines: 0,
            conversation_archives: 0,
            paused: false,
            resume_phase: None,
        }
    }

    /// Phase the machine is logically in, looking through a pause.
    pub fn effective_phase(&self) -> Phase {
        if self.paused {
            self.resume_phase.unwrap_or(Phase::Paused)
        } else {
            self.phase
        }
    }

    /// The single non-terminal attempt, if one exists.
    pub fn active_attempt(&self) -> Option<&Attempt> {
        self.attempts.last().filter(|a| !a.status.is_terminal())
    }

    fn active_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut().filter(|a| !a.status.is_terminal())
    }

    pub fn last_verification(&self) -> Option<&VerificationRecord> {
        self.attempts.iter().rev().find_map(|a| a.verification.as_ref())
    }

    /// Whether a new attempt may be scheduled right now.
    pub fn can_schedule(&self) -> bool {
        !self.paused
            && matches!(self.phase, Phase::Idle | Phase::FailedRetry | Phase::Stalled)
            && (self.attempts.len() as u32) < self.max_attempts
    }

    /// Start the next attempt. Sequence numbers are strictly increasing and
    /// the attempt that reaches `max_attempts` is still allowed to run.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if self.paused {
            return Err(anyhow!(InvalidTransitionError {
                phase: Phase::Paused,
                action: "begin attempt",
            }));
        }
        if self.phase == Phase::FailedExhausted {
            return Err(anyhow!(AttemptsExhaustedError {
                attempts: self.attempts.len() as u32,
                max_attempts: self.max_attempts,
            }));
        }
        if !matches!(self.phase, Phase::Idle | Phase::FailedRetry | Phase::Stalled) {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.phase,
                action: "begin attempt",
            }));
        }
        if self.active_attempt().is_some() {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.phase,
                action: "begin attempt with one already active",
            }));
        }
        let next_seq = self.attempts.len() as u32 + 1;
        if next_seq > self.max_attempts {
            return Err(anyhow!(AttemptsExhaustedError {
                attempts: self.attempts.len() as u32,
                max_attempts: self.max_attempts,
            }));
        }
        self.attempts.push(Attempt {
            seq: next_seq,
            status: AttemptStatus::Running,
            verification: None,
            rollover: None,
        });
        self.conversation_lines = 0;
        self.enter(Phase::Running);
        Ok(next_seq)
    }

    /// The active session signalled that it wants the verification gate.
    pub fn request_verification(&mut self) -> Result<()> {
        if self.effective_phase() != Phase::Running {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.effective_phase(),
                action: "request verification",
            }));
        }
        let attempt = self
            .active_attempt_mut()
            .ok_or_else(|| anyhow!("no active attempt"))?;
        attempt.status = AttemptStatus::AwaitingVerification;
        self.enter(Phase::AwaitingVerification);
        Ok(())
    }

    /// Record the gate outcome for the active attempt and advance the phase.
    ///
    /// An in-flight verification is allowed to complete while paused; only
    /// scheduling of the next attempt is blocked.
    pub fn record_verification(&mut self, record: VerificationRecord) -> Result<()> {
        if self.effective_phase() != Phase::AwaitingVerification {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.effective_phase(),
                action: "record verification",
            }));
        }
        let exhausted = self.attempts.len() as u32 >= self.max_attempts;
        let attempt = self
            .active_attempt_mut()
            .ok_or_else(|| anyhow!("no active attempt"))?;
        let passed = record.passed;
        let timed_out = record.timed_out;
        attempt.verification = Some(record);
        if passed {
            attempt.status = AttemptStatus::Passed;
            self.enter(Phase::Passed);
            return Ok(());
        }
        attempt.status = AttemptStatus::Failed;
        attempt.rollover = Some(if timed_out {
            RolloverCause::VerificationTimeout
        } else {
            RolloverCause::VerificationFailed
        });
        self.verified_failures += 1;
        if exhausted {
            self.enter(Phase::FailedExhausted);
        } else {
            self.enter(Phase::FailedRetry);
        }
        Ok(())
    }

    /// The heartbeat watchdog detected a silent session. Exactly one
    /// rollover per stall: a second call for the same attempt is rejected.
    pub fn record_stall(&mut self) -> Result<()> {
        if self.effective_phase() != Phase::Running {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.effective_phase(),
                action: "record stall",
            }));
        }
        let exhausted = self.attempts.len() as u32 >= self.max_attempts;
        let attempt = self
            .active_attempt_mut()
            .ok_or_else(|| anyhow!("no active attempt"))?;
        attempt.status = AttemptStatus::Stalled;
        attempt.rollover = Some(RolloverCause::HeartbeatStall);
        self.stall_rollovers += 1;
        if exhausted {
            self.enter(Phase::FailedExhausted);
        } else {
            self.enter(Phase::Stalled);
        }
        Ok(())
    }

    /// The worker process ended abnormally before reaching the gate. No
    /// verification record exists for such an attempt.
    pub fn record_worker_error(&mut self) -> Result<()> {
        if self.effective_phase() != Phase::Running {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.effective_phase(),
                action: "record worker error",
            }));
        }
        let exhausted = self.attempts.len() as u32 >= self.max_attempts;
        let attempt = self
            .active_attempt_mut()
            .ok_or_else(|| anyhow!("no active attempt"))?;
        attempt.status = AttemptStatus::Failed;
        attempt.rollover = Some(RolloverCause::WorkerError);
        self.worker_errors += 1;
        if exhausted {
            self.enter(Phase::FailedExhausted);
        } else {
            self.enter(Phase::FailedRetry);
        }
        Ok(())
    }

    /// Roll over an attempt left active by a process restart.
    ///
    /// A persisted `Running` or `AwaitingVerification` phase has no worker
    /// behind it any more; without this transition the loop would wait for
    /// an outcome that can never arrive. The attempt rolls over with cause
    /// `Interrupted`, counted with worker errors since it never reached the
    /// gate. Returns the recovered attempt's sequence number.
    pub fn recover_interrupted(&mut self) -> Option<u32> {
        if !matches!(
            self.effective_phase(),
            Phase::Running | Phase::AwaitingVerification
        ) {
            return None;
        }
        let exhausted = self.attempts.len() as u32 >= self.max_attempts;
        let seq = match self.active_attempt_mut() {
            Some(attempt) => {
                let seq = attempt.seq;
                attempt.status = AttemptStatus::Failed;
                attempt.rollover = Some(RolloverCause::Interrupted);
                seq
            }
            None => {
                // Mid-attempt phase with no attempt recorded; treat the
                // state as freshly schedulable.
                self.enter(Phase::Idle);
                return None;
            }
        };
        self.worker_errors += 1;
        if exhausted {
            self.enter(Phase::FailedExhausted);
        } else {
            self.enter(Phase::FailedRetry);
        }
        Some(seq)
    }

    /// Block scheduling of the next attempt. In-flight work keeps running.
    pub fn pause(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.phase,
                action: "pause",
            }));
        }
        if !self.paused {
            self.resume_phase = Some(self.phase);
            self.paused = true;
            self.phase = Phase::Paused;
        }
        Ok(())
    }

    /// Restore the phase captured at pause time.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Ok(());
        }
        self.phase = self.resume_phase.take().unwrap_or(Phase::Idle);
        self.paused = false;
        Ok(())
    }

    /// Terminal operator stop. The active attempt, if any, is marked aborted.
    pub fn abort(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(anyhow!(InvalidTransitionError {
                phase: self.phase,
                action: "abort",
            }));
        }
        if let Some(attempt) = self.active_attempt_mut() {
            attempt.status = AttemptStatus::Aborted;
        }
        self.enter(Phase::Aborted);
        Ok(())
    }

    pub fn record_conversation(&mut self, lines: u64, archives: u32) {
        self.conversation_lines = lines;
        self.conversation_archives = archives;
    }

    fn enter(&mut self, phase: Phase) {
        if phase.is_terminal() {
            self.paused = false;
            self.resume_phase = None;
            self.phase = phase;
        } else if self.paused {
            self.resume_phase = Some(phase);
        } else {
            self.phase = phase;
        }
    }
}
