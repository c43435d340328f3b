//! The analysis read path: load a source, plan and materialize chunks,
//! dispatch them to sub-workers in bounded waves, and synthesize a final
//! answer.
//!
//! Dispatch failures that are recoverable (malformed output, timeout) fall
//! back to the in-process recovery scan for that chunk, so one bad worker
//! degrades the answer instead of failing the query. A chunk that returns a
//! direct answer stops further waves; chunks already in flight complete.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::chunk::{ChunkRange, plan_chunks};
use crate::core::synthesize::{Answer, ChunkOutcome, finalize, merge, recovery_scan};
use crate::core::types::Provenance;
use crate::io::chunks::{ChunkHandle, materialize};
use crate::io::dispatch::{ChunkAnalyzer, DispatchRequest, is_recoverable};
use crate::io::store::ContextBlob;
use crate::pool::SubAgentPool;

/// Parameters for one analysis query.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub source: PathBuf,
    pub query: String,
    pub chunk_size_bytes: usize,
    pub chunk_overlap_bytes: usize,
    /// Directory chunks are materialized into; cleared per query.
    pub chunks_dir: PathBuf,
    pub max_sub_agents: usize,
    /// Recursion depth of the caller; the root session analyzes at 0.
    pub depth: u8,
}

/// Run one query against a source and synthesize the answer.
#[instrument(skip_all, fields(source = %request.source.display(), depth = request.depth))]
pub fn run_analysis<A>(analyzer: &Arc<A>, request: &AnalysisRequest) -> Result<Answer>
where
    A: ChunkAnalyzer + Send + Sync + 'static,
{
    let blob = ContextBlob::load(&request.source)?;
    let ranges = plan_chunks(
        blob.size(),
        request.chunk_size_bytes,
        request.chunk_overlap_bytes,
    )?;
    let handles = materialize(&blob, &ranges, &request.chunks_dir)?;
    info!(
        bytes = blob.size(),
        chunks = handles.len(),
        "analysis planned"
    );

    let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(handles.len());
    for wave in handles.chunks(request.max_sub_agents.max(1)) {
        run_wave(analyzer, request, wave, &mut outcomes)?;
        if outcomes.iter().any(|o| o.result.answer_if_complete.is_some()) {
            info!(
                dispatched = outcomes.len(),
                total = handles.len(),
                "direct answer received, skipping remaining chunks"
            );
            break;
        }
    }

    let buffer = merge(&outcomes);
    Ok(finalize(&buffer, &request.query))
}

/// Dispatch one wave of chunks through the sub-agent pool and collect the
/// outcomes, recovering per chunk where the failure allows it.
fn run_wave<A>(
    analyzer: &Arc<A>,
    request: &AnalysisRequest,
    wave: &[ChunkHandle],
    outcomes: &mut Vec<ChunkOutcome>,
) -> Result<()>
where
    A: ChunkAnalyzer + Send + Sync + 'static,
{
    let mut pool = SubAgentPool::new(request.max_sub_agents.max(1), request.depth);
    for handle in wave {
        let analyzer = Arc::clone(analyzer);
        let chunk = handle.clone();
        let query = request.query.clone();
        let depth = request.depth;
        pool.spawn(
            &format!("chunk-{:04}", handle.id),
            &request.query,
            move || {
                analyzer.dispatch(&DispatchRequest {
                    chunk: &chunk,
                    query: &query,
                    depth,
                })
            },
        )?;
    }

    for ((_, result), handle) in pool.join_all().into_iter().zip(wave) {
        let range = ChunkRange {
            id: handle.id,
            start: handle.start,
            end: handle.end,
        };
        match result {
            Ok(result) => outcomes.push(ChunkOutcome {
                range,
                result,
                provenance: Provenance::Delegated,
            }),
            Err(err) if is_recoverable(&err) => {
                warn!(chunk_id = handle.id, err = %err, "dispatch failed, recovering in-process");
                let text = fs::read_to_string(&handle.path)
                    .with_context(|| format!("read chunk {}", handle.path.display()))?;
                outcomes.push(ChunkOutcome {
                    result: recovery_scan(&range, &text, &request.query),
                    range,
                    provenance: Provenance::Recovered,
                });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use crate::core::types::{Confidence, Finding, SubWorkerResult};
    use crate::io::dispatch::MalformedResultError;

    /// Analyzer with canned per-chunk behavior; records dispatched ids.
    struct ScriptedAnalyzer {
        fail_chunks: BTreeSet<u32>,
        direct_answer_chunk: Option<u32>,
        dispatched: Mutex<Vec<u32>>,
    }

    impl ScriptedAnalyzer {
        fn new() -> Self {
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
                .expect("lock")
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
                    category: "test".to_string(),
                }],
                metrics: BTreeMap::new(),
                missing: Vec::new(),
                suggested_next_queries: Vec::new(),
                answer_if_complete: (self.direct_answer_chunk == Some(request.chunk.id))
                    .then(|| "direct".to_string()),
            })
        }
    }

    fn request(temp: &Path, query: &str, chunk_size: usize) -> AnalysisRequest {
        AnalysisRequest {
            source: temp.join("source.txt"),
            query: query.to_string(),
            chunk_size_bytes: chunk_size,
            chunk_overlap_bytes: 0,
            chunks_dir: temp.join("chunks"),
            max_sub_agents: 2,
            depth: 0,
        }
    }

    fn write_source(temp: &Path, bytes: usize) {
        let mut text = String::new();
        let mut line = 0;
        while text.len() < bytes {
            line += 1;
            text.push_str(&format!("the quick brown fox line {line}\n"));
        }
        text.truncate(bytes);
        fs::write(temp.join("source.txt"), text).expect("write source");
    }

    #[test]
    fn all_chunks_dispatched_and_answer_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_source(temp.path(), 500);
        let analyzer = Arc::new(ScriptedAnalyzer::new());

        let answer = run_analysis(&analyzer, &request(temp.path(), "fox", 100)).expect("run");
        assert!(answer.complete);
        assert_eq!(analyzer.dispatched.lock().expect("lock").len(), 5);
        assert_eq!(answer.citations.len(), 5);
        assert!(
            answer
                .citations
                .iter()
                .all(|c| c.provenance == Provenance::Delegated)
        );
    }

    /// A failed dispatch degrades to the recovery scan instead of failing
    /// the whole query; the recovered chunk is marked as such.
    #[test]
    fn failed_chunk_is_recovered_in_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_source(temp.path(), 300);
        let mut analyzer = ScriptedAnalyzer::new();
        analyzer.fail_chunks.insert(1);
        let analyzer = Arc::new(analyzer);

        let answer = run_analysis(&analyzer, &request(temp.path(), "quick fox", 100)).expect("run");
        let recovered: Vec<_> = answer
            .citations
            .iter()
            .filter(|c| c.provenance == Provenance::Recovered)
            .collect();
        assert!(!recovered.is_empty());
        assert!(recovered.iter().all(|c| c.chunk_id == 1));
        // Other chunks still answered by delegation.
        assert!(
            answer
                .citations
                .iter()
                .any(|c| c.provenance == Provenance::Delegated)
        );
    }

    /// A direct answer from an early wave stops later waves from being
    /// dispatched at all.
    #[test]
    fn direct_answer_short_circuits_remaining_waves() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_source(temp.path(), 1000);
        let mut analyzer = ScriptedAnalyzer::new();
        analyzer.direct_answer_chunk = Some(0);
        let analyzer = Arc::new(analyzer);

        // 10 chunks, waves of 2: the first wave answers directly.
        let answer = run_analysis(&analyzer, &request(temp.path(), "fox", 100)).expect("run");
        assert!(answer.complete);
        assert_eq!(answer.text, "direct");
        assert!(analyzer.dispatched.lock().expect("lock").len() <= 2);
    }

    #[test]
    fn empty_source_yields_empty_incomplete_answer() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("source.txt"), "").expect("write");
        let analyzer = Arc::new(ScriptedAnalyzer::new());

        let answer = run_analysis(&analyzer, &request(temp.path(), "fox", 100)).expect("run");
        assert!(!answer.complete);
        assert!(answer.citations.is_empty());
    }
}
