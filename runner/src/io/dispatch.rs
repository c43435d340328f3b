//! Sub-worker dispatch: hands one materialized chunk plus a query to a
//! stateless analysis worker and collects its structured result.
//!
//! The [`ChunkAnalyzer`] trait decouples the read path from the worker
//! backend; tests use scripted analyzers that never spawn processes.
//! Malformed output and timeouts are typed, recoverable errors: the caller
//! falls back to the in-process recovery scan instead of failing the query.

use std::fmt;
use std::fs;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::SubWorkerResult;
use crate::io::chunks::ChunkHandle;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{SubWorkerPromptInputs, render_subworker_prompt};

const RESULT_SCHEMA: &str = include_str!("../../schemas/subworker_result.schema.json");

/// Environment variable carrying the recursion depth into spawned workers.
pub const DEPTH_ENV: &str = "RLM_DEPTH";

/// Sub-workers run one hop below the root session and never deeper.
pub const MAX_DISPATCH_DEPTH: u8 = 1;

/// The worker produced missing, invalid, or absent structured output.
#[derive(Debug, Clone)]
pub struct MalformedResultError {
    pub chunk_id: u32,
    pub detail: String,
}

impl fmt::Display for MalformedResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed result for chunk {}: {}", self.chunk_id, self.detail)
    }
}

impl std::error::Error for MalformedResultError {}

/// The worker did not finish within the dispatch timeout.
#[derive(Debug, Clone)]
pub struct DispatchTimeoutError {
    pub chunk_id: u32,
    pub timeout: Duration,
}

impl fmt::Display for DispatchTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch for chunk {} timed out after {:?}", self.chunk_id, self.timeout)
    }
}

impl std::error::Error for DispatchTimeoutError {}

/// Dispatch was requested from a depth where recursion is not allowed.
#[derive(Debug, Clone, Copy)]
pub struct DepthExceededError {
    pub depth: u8,
}

impl fmt::Display for DepthExceededError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatch at depth {} refused (sub-workers may not spawn sub-workers)",
            self.depth
        )
    }
}

impl std::error::Error for DepthExceededError {}

/// Whether a dispatch error is recoverable via the in-process scan.
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MalformedResultError>().is_some()
        || err.downcast_ref::<DispatchTimeoutError>().is_some()
}

/// Parameters for one dispatch call.
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub chunk: &'a ChunkHandle,
    pub query: &'a str,
    /// Depth of the caller. The root session dispatches at 0; the spawned
    /// worker runs at depth + 1.
    pub depth: u8,
}

/// Abstraction over chunk analysis backends.
pub trait ChunkAnalyzer {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<SubWorkerResult>;
}

/// Analyzer that spawns an external worker process.
///
/// The worker receives the rendered chunk prompt on stdin and must print a
/// single JSON object matching the embedded result schema. It inherits
/// `RLM_DEPTH` so a nested invocation of this crate refuses to dispatch
/// further.
pub struct ProcessAnalyzer {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ChunkAnalyzer for ProcessAnalyzer {
    #[instrument(skip_all, fields(chunk_id = request.chunk.id, depth = request.depth))]
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<SubWorkerResult> {
        // `>=` rather than arithmetic on depth: the value comes from the
        // environment and may be anywhere in u8 range.
        if request.depth >= MAX_DISPATCH_DEPTH {
            return Err(anyhow!(DepthExceededError { depth: request.depth }));
        }
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("analyzer command must not be empty"))?;

        let chunk_text = fs::read_to_string(&request.chunk.path)
            .with_context(|| format!("read chunk {}", request.chunk.path.display()))?;
        let prompt = render_subworker_prompt(&SubWorkerPromptInputs {
            query: request.query,
            chunk_id: request.chunk.id,
            chunk_start: request.chunk.start,
            chunk_end: request.chunk.end,
            chunk_text: &chunk_text,
        })?;

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .env(DEPTH_ENV, (request.depth + 1).to_string());

        debug!(timeout_secs = self.timeout.as_secs(), "dispatching chunk");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run analysis worker")?;

        if output.timed_out {
            warn!(chunk_id = request.chunk.id, "dispatch timed out");
            return Err(anyhow!(DispatchTimeoutError {
                chunk_id: request.chunk.id,
                timeout: self.timeout,
            }));
        }
        if !output.status.success() {
            return Err(anyhow!(MalformedResultError {
                chunk_id: request.chunk.id,
                detail: format!(
                    "worker exited with status {:?} without structured output",
                    output.status.code()
                ),
            }));
        }

        parse_result(request.chunk.id, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse and schema-validate raw sub-worker output.
///
/// Absence of any required field classifies the result malformed rather
/// than surfacing a serde error.
pub fn parse_result(chunk_id: u32, raw: &str) -> Result<SubWorkerResult> {
    let malformed = |detail: String| {
        anyhow!(MalformedResultError {
            chunk_id,
            detail,
        })
    };

    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| malformed(format!("not valid JSON: {e}")))?;
    validate_against_schema(&value).map_err(&malformed)?;

    let result: SubWorkerResult = serde_json::from_value(value)
        .map_err(|e| malformed(format!("schema-valid JSON failed to deserialize: {e}")))?;
    if result.chunk_id != chunk_id {
        return Err(malformed(format!(
            "chunk id mismatch (expected {chunk_id}, got {})",
            result.chunk_id
        )));
    }
    Ok(result)
}

fn validate_against_schema(instance: &Value) -> std::result::Result<(), String> {
    let schema: Value =
        serde_json::from_str(RESULT_SCHEMA).expect("embedded result schema should be valid JSON");
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| format!("compile result schema: {e}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join("; "))
    }
}
