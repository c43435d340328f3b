//! Scripted doubles and workspace helpers for tests.
//!
//! Enabled via the `test-support` feature (pulled in by the self
//! dev-dependency) so integration tests can drive the supervisor and the
//! analysis path without spawning real worker processes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::supervisor::VerificationRecord;
use crate::core::types::{Confidence, Finding, SubWorkerResult};
use crate::io::config::RunnerConfig;
use crate::io::conversation::ConversationLog;
use crate::io::dispatch::{ChunkAnalyzer, DispatchRequest, MalformedResultError};
use crate::io::init::{InitOptions, RunnerPaths, init_workspace};
use crate::io::verify::{VerifyRequest, VerifyRunner};
use crate::io::worker::{AttemptEnd, AttemptRequest, WorkerRunner};

/// Worker that plays back a fixed sequence of attempt endings.
pub struct ScriptedWorkerRunner {
    ends: Mutex<Vec<AttemptEnd>>,
    /// Lines appended to the transcript per attempt, for rotation tests.
    pub transcript_lines_per_attempt: usize,
}

impl ScriptedWorkerRunner {
    pub fn new(ends: Vec<AttemptEnd>) -> Self {
        Self {
            ends: Mutex::new(ends),
            transcript_lines_per_attempt: 1,
        }
    }
}

impl WorkerRunner for ScriptedWorkerRunner {
    fn run(
        &self,
        _request: &AttemptRequest,
        transcript: &mut ConversationLog,
    ) -> Result<AttemptEnd> {
        for i in 0..self.transcript_lines_per_attempt {
            transcript.append_line(&format!("worker line {i}"))?;
        }
        let mut ends = self.ends.lock().expect("scripted ends lock");
        if ends.is_empty() {
            return Err(anyhow!("scripted worker ran out of attempt endings"));
        }
        Ok(ends.remove(0))
    }
}

/// Verifier that plays back a fixed sequence of gate records.
pub struct ScriptedVerifier {
    records: Mutex<Vec<VerificationRecord>>,
}

impl ScriptedVerifier {
    pub fn new(records: Vec<VerificationRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn passing() -> VerificationRecord {
        VerificationRecord {
            passed: true,
            exit_code: Some(0),
            timed_out: false,
            duration_ms: 1,
            log_path: None,
            output_excerpt: String::new(),
        }
    }

    pub fn failing(excerpt: &str) -> VerificationRecord {
        VerificationRecord {
            passed: false,
            exit_code: Some(1),
            timed_out: false,
            duration_ms: 1,
            log_path: None,
            output_excerpt: excerpt.to_string(),
        }
    }
}

impl VerifyRunner for ScriptedVerifier {
    fn run(&self, _request: &VerifyRequest) -> Result<VerificationRecord> {
        let mut records = self.records.lock().expect("scripted records lock");
        if records.is_empty() {
            return Err(anyhow!("scripted verifier ran out of records"));
        }
        Ok(records.remove(0))
    }
}

/// Analyzer with one high-confidence finding per chunk and optional
/// scripted failures.
pub struct ScriptedAnalyzer {
    pub fail_chunks: BTreeSet<u32>,
    pub direct_answer_chunk: Option<u32>,
    pub dispatched: Mutex<Vec<u32>>,
}

impl Default for ScriptedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self {
            fail_chunks: BTreeSet::new(),
            direct_answer_chunk: None,
            dispatched: Mutex::new(Vec::new()),
        }
    }
}

impl ChunkAnalyzer for ScriptedAnalyzer {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<SubWorkerResult> {
        self.dispatched
            .lock()
            .expect("dispatched lock")
            .push(request.chunk.id);
        if self.fail_chunks.contains(&request.chunk.id) {
            return Err(anyhow!(MalformedResultError {
                chunk_id: request.chunk.id,
                detail: "scripted failure".to_string(),
            }));
        }
        Ok(SubWorkerResult {
            chunk_id: request.chunk.id,
            chunk_summary: format!("chunk {}", request.chunk.id),
            relevant: vec![Finding {
                point: format!("point from chunk {}", request.chunk.id),
                evidence: format!("evidence {}", request.chunk.id),
                confidence: Confidence::High,
                category: "scripted".to_string(),
            }],
            metrics: BTreeMap::new(),
            missing: Vec::new(),
            suggested_next_queries: Vec::new(),
            answer_if_complete: (self.direct_answer_chunk == Some(request.chunk.id))
                .then(|| "scripted direct answer".to_string()),
        })
    }
}

/// An initialized `.rlm/` workspace inside a temp directory.
pub struct TestWorkspace {
    pub temp: tempfile::TempDir,
    pub paths: RunnerPaths,
}

impl TestWorkspace {
    pub fn init() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions::default()).expect("init workspace");
        Self { temp, paths }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn config(&self) -> RunnerConfig {
        RunnerConfig::default()
    }

    /// Write a source file and return its path.
    pub fn write_source(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("write source");
        path
    }
}
