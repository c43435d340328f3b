//! Worker session lifecycle and the fixed read interface over a loaded
//! context.
//!
//! A session moves `Created -> ContextLoaded -> Working -> VerifyRequested
//! -> Terminated` and never backwards. Until the context is loaded,
//! destructive operations are refused when the gate is enabled. Reads go
//! through a small fixed surface (`peek`, `search`, `extract`, `stats`) with
//! hard limits: a `peek` may not exceed `max_slice_lines`, and spans above
//! `search_required_threshold_lines` are refused until at least one search
//! has narrowed the target.
//!
//! The worker reaches this surface through the `context` CLI subcommands,
//! one short-lived process per call, so the session itself is persisted as a
//! snapshot (`state/session.json`) and rehydrated on every invocation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::io::config::RunnerConfig;
use crate::io::store::{ContextBlob, SearchMatch};

/// Session lifecycle phase. Strictly forward-moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Created,
    ContextLoaded,
    Working,
    VerifyRequested,
    Terminated,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::ContextLoaded => "context-loaded",
            SessionPhase::Working => "working",
            SessionPhase::VerifyRequested => "verify-requested",
            SessionPhase::Terminated => "terminated",
        }
    }
}

/// Raised on a lifecycle step the current phase does not allow.
#[derive(Debug, Clone, Copy)]
pub struct SessionPhaseError {
    pub phase: SessionPhase,
    pub action: &'static str,
}

impl fmt::Display for SessionPhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {}", self.action, self.phase.as_str())
    }
}

impl std::error::Error for SessionPhaseError {}

/// Raised when a destructive operation is attempted before the context is
/// loaded and the gate is enabled.
#[derive(Debug, Clone)]
pub struct DestructiveGateError {
    pub operation: String,
}

impl fmt::Display for DestructiveGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "destructive operation '{}' refused before context is loaded",
            self.operation
        )
    }
}

impl std::error::Error for DestructiveGateError {}

/// Raised when a `peek` asks for more lines than one slice may carry.
#[derive(Debug, Clone, Copy)]
pub struct SliceTooLargeError {
    pub requested: usize,
    pub max: usize,
}

impl fmt::Display for SliceTooLargeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slice of {} lines exceeds the {}-line limit",
            self.requested, self.max
        )
    }
}

impl std::error::Error for SliceTooLargeError {}

/// Raised when a large read is attempted before any search narrowed it.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequiredError {
    pub requested: usize,
    pub threshold: usize,
}

impl fmt::Display for SearchRequiredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reading {} lines requires a prior search (threshold {})",
            self.requested, self.threshold
        )
    }
}

impl std::error::Error for SearchRequiredError {}

/// Summary statistics of the loaded context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub bytes: usize,
    pub lines: usize,
    pub files: usize,
}

/// One structured record found in the context by `extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Byte offset where the record starts.
    pub offset: usize,
    /// 1-indexed line of the record start.
    pub line: usize,
    pub value: serde_json::Value,
}

/// Persistable session state, enough to rehydrate across CLI invocations.
/// The context itself is reloaded from its source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub source: Option<PathBuf>,
    pub searched: bool,
}

/// One worker session over at most one loaded context.
#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    blob: Option<ContextBlob>,
    searched: bool,
    max_slice_lines: usize,
    search_required_threshold_lines: usize,
    gate_destructive: bool,
}

impl Session {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            phase: SessionPhase::Created,
            blob: None,
            searched: false,
            max_slice_lines: config.max_slice_lines,
            search_required_threshold_lines: config.search_required_threshold_lines,
            gate_destructive: config.gate_destructive_tools_until_context_loaded,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Load the source into the session's context store.
    pub fn load_context(&mut self, source: &Path) -> Result<()> {
        if self.phase != SessionPhase::Created {
            return Err(anyhow!(SessionPhaseError {
                phase: self.phase,
                action: "load context",
            }));
        }
        let blob = ContextBlob::load(source)?;
        info!(source = %source.display(), bytes = blob.size(), "session context loaded");
        self.blob = Some(blob);
        self.phase = SessionPhase::ContextLoaded;
        Ok(())
    }

    pub fn begin_work(&mut self) -> Result<()> {
        if self.phase != SessionPhase::ContextLoaded {
            return Err(anyhow!(SessionPhaseError {
                phase: self.phase,
                action: "begin work",
            }));
        }
        self.phase = SessionPhase::Working;
        Ok(())
    }

    pub fn request_verification(&mut self) -> Result<()> {
        if self.phase != SessionPhase::Working {
            return Err(anyhow!(SessionPhaseError {
                phase: self.phase,
                action: "request verification",
            }));
        }
        self.phase = SessionPhase::VerifyRequested;
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.phase = SessionPhase::Terminated;
    }

    /// Check a destructive operation against the context gate.
    pub fn authorize_destructive(&self, operation: &str) -> Result<()> {
        if self.gate_destructive && self.phase == SessionPhase::Created {
            return Err(anyhow!(DestructiveGateError {
                operation: operation.to_string(),
            }));
        }
        Ok(())
    }

    fn loaded(&self) -> Result<&ContextBlob> {
        self.blob.as_ref().ok_or_else(|| {
            anyhow!(SessionPhaseError {
                phase: self.phase,
                action: "read context",
            })
        })
    }

    /// Read 1-indexed lines `[first, last]` of the context.
    ///
    /// Spans above the slice limit are refused outright; spans above the
    /// search threshold are refused until a search has run in this session.
    pub fn peek(&self, first: usize, last: usize) -> Result<&str> {
        let blob = self.loaded()?;
        let requested = last.saturating_sub(first) + 1;
        if requested > self.max_slice_lines {
            return Err(anyhow!(SliceTooLargeError {
                requested,
                max: self.max_slice_lines,
            }));
        }
        if requested > self.search_required_threshold_lines && !self.searched {
            return Err(anyhow!(SearchRequiredError {
                requested,
                threshold: self.search_required_threshold_lines,
            }));
        }
        let (start, end) = blob.line_range(first, last)?;
        blob.slice(start, end)
    }

    /// Search the context, unlocking large reads for the session.
    pub fn search(&mut self, pattern: &str, max_matches: usize) -> Result<Vec<SearchMatch>> {
        let regex =
            Regex::new(pattern).map_err(|e| anyhow!("invalid search pattern '{pattern}': {e}"))?;
        let blob = self.loaded()?;
        let matches: Vec<SearchMatch> = blob.search(&regex, max_matches).collect();
        debug!(pattern, hits = matches.len(), "session search");
        self.searched = true;
        Ok(matches)
    }

    /// Scan the context for embedded JSON objects, in offset order, at most
    /// `max_items` of them.
    ///
    /// Anything between records (log prefixes, prose, stray braces) is
    /// skipped; a record's nested objects are consumed as part of it.
    pub fn extract_structured(&self, max_items: usize) -> Result<Vec<ExtractedRecord>> {
        let blob = self.loaded()?;
        let text = blob.text();
        let bytes = text.as_bytes();
        let mut records = Vec::new();
        let mut idx = 0;
        while idx < bytes.len() && records.len() < max_items {
            if bytes[idx] != b'{' {
                idx += 1;
                continue;
            }
            let mut stream =
                serde_json::Deserializer::from_str(&text[idx..]).into_iter::<serde_json::Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset().max(1);
                    records.push(ExtractedRecord {
                        offset: idx,
                        line: blob.line_of_offset(idx),
                        value,
                    });
                    idx += consumed;
                }
                _ => idx += 1,
            }
        }
        debug!(found = records.len(), "structured extraction");
        Ok(records)
    }

    pub fn stats(&self) -> Result<ContextStats> {
        let blob = self.loaded()?;
        Ok(ContextStats {
            bytes: blob.size(),
            lines: blob.line_count(),
            files: blob.files().len(),
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            source: self.blob.as_ref().map(|b| b.source().to_path_buf()),
            searched: self.searched,
        }
    }

    /// Rehydrate a session from a snapshot, reloading the context from its
    /// recorded source.
    pub fn restore(config: &RunnerConfig, snapshot: &SessionSnapshot) -> Result<Self> {
        let mut session = Session::new(config);
        if let Some(source) = &snapshot.source {
            session.blob = Some(ContextBlob::load(source)?);
        }
        session.phase = snapshot.phase;
        session.searched = snapshot.searched;
        Ok(session)
    }
}

/// Load the persisted session for a workspace. A missing snapshot file
/// means a fresh session.
pub fn load_session(config: &RunnerConfig, path: &Path) -> Result<Session> {
    if !path.exists() {
        return Ok(Session::new(config));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let snapshot: SessionSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    Session::restore(config, &snapshot)
}

/// Persist the session snapshot atomically.
pub fn save_session(session: &Session, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(&session.snapshot())?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(max_slice: usize, threshold: usize) -> RunnerConfig {
        RunnerConfig {
            max_slice_lines: max_slice,
            search_required_threshold_lines: threshold,
            ..RunnerConfig::default()
        }
    }

    fn source_with_lines(dir: &Path, count: usize) -> std::path::PathBuf {
        let path = dir.join("context.txt");
        let text: String = (1..=count).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, text).expect("write");
        path
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 3);
        let mut session = Session::new(&config(10, 5));

        assert_eq!(session.phase(), SessionPhase::Created);
        session.load_context(&source).expect("load");
        assert_eq!(session.phase(), SessionPhase::ContextLoaded);
        assert!(session.load_context(&source).is_err());

        session.begin_work().expect("work");
        session.request_verification().expect("verify");
        assert!(session.begin_work().is_err());
        session.terminate();
        assert_eq!(session.phase(), SessionPhase::Terminated);
    }

    #[test]
    fn destructive_gate_lifts_after_context_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 1);
        let mut session = Session::new(&config(10, 5));

        let err = session.authorize_destructive("delete file").unwrap_err();
        assert!(err.downcast_ref::<DestructiveGateError>().is_some());

        session.load_context(&source).expect("load");
        session.authorize_destructive("delete file").expect("allowed");
    }

    #[test]
    fn gate_disabled_allows_destructive_immediately() {
        let mut cfg = config(10, 5);
        cfg.gate_destructive_tools_until_context_loaded = false;
        let session = Session::new(&cfg);
        session.authorize_destructive("rm -rf").expect("allowed");
    }

    #[test]
    fn peek_over_slice_limit_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 50);
        let mut session = Session::new(&config(10, 5));
        session.load_context(&source).expect("load");

        let err = session.peek(1, 20).unwrap_err();
        let too_large = err.downcast_ref::<SliceTooLargeError>().expect("typed");
        assert_eq!(too_large.requested, 20);
    }

    #[test]
    fn large_peek_requires_prior_search() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 50);
        let mut session = Session::new(&config(20, 5));
        session.load_context(&source).expect("load");

        let err = session.peek(1, 10).unwrap_err();
        assert!(err.downcast_ref::<SearchRequiredError>().is_some());

        session.search("line 7", 10).expect("search");
        let text = session.peek(1, 10).expect("peek after search");
        assert!(text.contains("line 7"));
    }

    #[test]
    fn small_peek_needs_no_search() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 50);
        let mut session = Session::new(&config(20, 5));
        session.load_context(&source).expect("load");
        assert_eq!(session.peek(3, 3).expect("peek"), "line 3\n");
    }

    #[test]
    fn stats_reports_context_shape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 4);
        let mut session = Session::new(&config(10, 5));
        session.load_context(&source).expect("load");
        let stats = session.stats().expect("stats");
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn extract_finds_json_records_between_prose() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("app.log");
        fs::write(
            &path,
            concat!(
                "2024-01-01 INFO started\n",
                "2024-01-01 INFO event {\"kind\": \"login\", \"user\": \"ada\"}\n",
                "plain line with a stray { brace\n",
                "{\"kind\": \"logout\", \"nested\": {\"ok\": true}}\n",
            ),
        )
        .expect("write");
        let mut session = Session::new(&config(10, 5));
        session.load_context(&path).expect("load");

        let records = session.extract_structured(10).expect("extract");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, 2);
        assert_eq!(records[0].value["kind"], "login");
        // The nested object belongs to its record, not a third hit.
        assert_eq!(records[1].value["nested"]["ok"], true);
        assert!(records[0].offset < records[1].offset);
    }

    #[test]
    fn extract_respects_max_items() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("records.jsonl");
        let text: String = (0..10).map(|i| format!("{{\"n\": {i}}}\n")).collect();
        fs::write(&path, text).expect("write");
        let mut session = Session::new(&config(10, 5));
        session.load_context(&path).expect("load");
        assert_eq!(session.extract_structured(3).expect("extract").len(), 3);
    }

    #[test]
    fn extract_on_context_without_records_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 5);
        let mut session = Session::new(&config(10, 5));
        session.load_context(&source).expect("load");
        assert!(session.extract_structured(10).expect("extract").is_empty());
    }

    /// A session survives across invocations: the snapshot keeps the loaded
    /// source, the phase, and the searched flag that unlocks large reads.
    #[test]
    fn session_round_trips_through_snapshot_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = source_with_lines(temp.path(), 50);
        let snapshot_path = temp.path().join("state/session.json");
        let cfg = config(20, 5);

        let mut session = Session::new(&cfg);
        session.load_context(&source).expect("load");
        session.begin_work().expect("work");
        session.search("line 7", 10).expect("search");
        save_session(&session, &snapshot_path).expect("save");

        let restored = load_session(&cfg, &snapshot_path).expect("restore");
        assert_eq!(restored.phase(), SessionPhase::Working);
        // Large read is still unlocked by the earlier search.
        let text = restored.peek(1, 10).expect("peek after restore");
        assert!(text.contains("line 7"));
        assert_eq!(restored.stats().expect("stats").lines, 50);
    }

    #[test]
    fn missing_snapshot_loads_a_fresh_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = load_session(&config(10, 5), &temp.path().join("absent.json"))
            .expect("load");
        assert_eq!(session.phase(), SessionPhase::Created);
        assert!(session.stats().is_err());
    }
}
