//! Supervisor state persistence.
//!
//! The supervisor survives process restarts: every phase transition is
//! flushed to `.rlm/state/supervisor.json` atomically, and per-attempt
//! metadata lands under `.rlm/attempts/<seq>/meta.json` so failed attempts
//! remain auditable after rollover.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::supervisor::{Attempt, SupervisorState};
use crate::io::init::RunnerPaths;

/// Load persisted supervisor state, or `None` when no run has started.
pub fn load_supervisor_state(path: &Path) -> Result<Option<SupervisorState>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read supervisor state {}", path.display()))?;
    let state: SupervisorState = serde_json::from_str(&contents)
        .with_context(|| format!("parse supervisor state {}", path.display()))?;
    Ok(Some(state))
}

/// Atomically persist supervisor state (temp file + rename).
pub fn write_supervisor_state(path: &Path, state: &SupervisorState) -> Result<()> {
    write_json(path, state)
}

/// Resolved paths of one attempt's artifact directory.
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub transcript_path: PathBuf,
    pub transcript_archive_dir: PathBuf,
    pub verify_log_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(root: &Path, seq: u32) -> Self {
        let dir = RunnerPaths::new(root).attempt_dir(seq);
        Self {
            meta_path: dir.join("meta.json"),
            transcript_path: dir.join("transcript.log"),
            transcript_archive_dir: dir.join("transcript-archives"),
            verify_log_path: dir.join("verify.log"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create attempt dir {}", self.dir.display()))
    }
}

/// Write the attempt record to `meta.json`.
pub fn write_attempt_meta(paths: &AttemptPaths, attempt: &Attempt) -> Result<()> {
    paths.create()?;
    write_json(&paths.meta_path, attempt)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
