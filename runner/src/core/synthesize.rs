//! Synthesis of per-chunk sub-worker results into an evidence buffer and a
//! final answer with citations.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::chunk::ChunkRange;
use crate::core::types::{Confidence, Finding, Provenance, SubWorkerResult};

/// One chunk's result together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub range: ChunkRange,
    pub result: SubWorkerResult,
    pub provenance: Provenance,
}

/// A deduplicated finding with provenance, as accumulated by `merge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub chunk_id: u32,
    /// Byte range of the source chunk within the blob.
    pub start: usize,
    pub end: usize,
    pub point: String,
    pub evidence: String,
    pub confidence: Confidence,
    pub category: String,
    pub provenance: Provenance,
}

/// Accumulated synthesized findings for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBuffer {
    /// Fragments in chunk-id order, deduplicated.
    pub fragments: Vec<Fragment>,
    /// Unresolved items aggregated across results, deduplicated.
    pub missing: Vec<String>,
    /// Follow-up queries suggested by sub-workers, deduplicated.
    pub suggested: Vec<String>,
    /// Direct answer from the lowest-id chunk that reported one.
    pub direct_answer: Option<String>,
}

/// Citation attached to the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: u32,
    pub start: usize,
    pub end: usize,
    pub evidence: String,
    pub provenance: Provenance,
}

/// Final answer for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub query: String,
    pub text: String,
    /// False when no chunk yielded enough confidence; `missing` then lists
    /// what remained unresolved.
    pub complete: bool,
    pub citations: Vec<Citation>,
    pub missing: Vec<String>,
    pub suggested_next_queries: Vec<String>,
}

/// Merge chunk outcomes into an evidence buffer.
///
/// Outcomes are merged in chunk-id order regardless of arrival order.
/// Findings with identical evidence text whose source chunk ranges overlap
/// collapse into one fragment keeping the highest confidence, which makes
/// the merge idempotent.
pub fn merge(outcomes: &[ChunkOutcome]) -> EvidenceBuffer {
    let mut sorted: Vec<&ChunkOutcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.range.id);

    let mut buffer = EvidenceBuffer::default();
    for outcome in sorted {
        for finding in &outcome.result.relevant {
            push_deduplicated(&mut buffer.fragments, outcome, finding);
        }
        for item in &outcome.result.missing {
            if !buffer.missing.contains(item) {
                buffer.missing.push(item.clone());
            }
        }
        for query in &outcome.result.suggested_next_queries {
            if !buffer.suggested.contains(query) {
                buffer.suggested.push(query.clone());
            }
        }
        if buffer.direct_answer.is_none()
            && let Some(answer) = &outcome.result.answer_if_complete
        {
            buffer.direct_answer = Some(answer.clone());
        }
    }
    debug!(
        fragments = buffer.fragments.len(),
        missing = buffer.missing.len(),
        direct = buffer.direct_answer.is_some(),
        "merged chunk outcomes"
    );
    buffer
}

fn push_deduplicated(fragments: &mut Vec<Fragment>, outcome: &ChunkOutcome, finding: &Finding) {
    for existing in fragments.iter_mut() {
        let existing_range = ChunkRange {
            id: existing.chunk_id,
            start: existing.start,
            end: existing.end,
        };
        if existing.evidence == finding.evidence && existing_range.overlaps(&outcome.range) {
            if finding.confidence > existing.confidence {
                existing.confidence = finding.confidence;
            }
            return;
        }
    }
    fragments.push(Fragment {
        chunk_id: outcome.range.id,
        start: outcome.range.start,
        end: outcome.range.end,
        point: finding.point.clone(),
        evidence: finding.evidence.clone(),
        confidence: finding.confidence,
        category: finding.category.clone(),
        provenance: outcome.provenance,
    });
}

/// Produce the final answer from an evidence buffer.
///
/// A direct answer from any chunk is preferred. Otherwise the answer is
/// composed from findings; without at least one high-confidence finding it
/// is flagged incomplete and lists the aggregated `missing` items.
pub fn finalize(buffer: &EvidenceBuffer, query: &str) -> Answer {
    let citations: Vec<Citation> = buffer
        .fragments
        .iter()
        .map(|f| Citation {
            chunk_id: f.chunk_id,
            start: f.start,
            end: f.end,
            evidence: f.evidence.clone(),
            provenance: f.provenance,
        })
        .collect();

    if let Some(direct) = &buffer.direct_answer {
        return Answer {
            query: query.to_string(),
            text: direct.clone(),
            complete: true,
            citations,
            missing: Vec::new(),
            suggested_next_queries: buffer.suggested.clone(),
        };
    }

    let complete = buffer
        .fragments
        .iter()
        .any(|f| f.confidence == Confidence::High);

    let mut ranked: Vec<&Fragment> = buffer.fragments.iter().collect();
    ranked.sort_by(|a, b| b.confidence.cmp(&a.confidence).then(a.chunk_id.cmp(&b.chunk_id)));
    let text = if ranked.is_empty() {
        format!("No findings for query: {query}")
    } else {
        ranked
            .iter()
            .take(5)
            .map(|f| f.point.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    Answer {
        query: query.to_string(),
        text,
        complete,
        citations,
        missing: if complete { Vec::new() } else { buffer.missing.clone() },
        suggested_next_queries: buffer.suggested.clone(),
    }
}

/// Degraded in-process analysis of one chunk, used when dispatch is
/// unavailable (malformed result or timeout).
///
/// Scans chunk lines for query terms and emits findings equivalent in shape
/// to a sub-worker result. Callers tag the outcome `Provenance::Recovered`.
pub fn recovery_scan(range: &ChunkRange, text: &str, query: &str) -> SubWorkerResult {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect();

    let mut relevant = Vec::new();
    let mut lines_scanned = 0u64;
    for (idx, line) in text.lines().enumerate() {
        lines_scanned += 1;
        let lowered = line.to_lowercase();
        let hits = terms.iter().filter(|t| lowered.contains(t.as_str())).count();
        if hits == 0 {
            continue;
        }
        relevant.push(Finding {
            point: format!("chunk {} line {} matches the query", range.id, idx + 1),
            evidence: line.trim_end().to_string(),
            confidence: if hits > 1 {
                Confidence::Medium
            } else {
                Confidence::Low
            },
            category: "recovered".to_string(),
        });
    }

    let mut metrics = std::collections::BTreeMap::new();
    metrics.insert("lines_scanned".to_string(), lines_scanned);
    metrics.insert("matches".to_string(), relevant.len() as u64);

    SubWorkerResult {
        chunk_id: range.id,
        chunk_summary: format!("in-process scan of chunk {} ({} lines)", range.id, lines_scanned),
        relevant,
        metrics,
        missing: if terms.is_empty() {
            vec!["query contained no scannable terms".to_string()]
        } else {
            Vec::new()
        },
        suggested_next_queries: Vec::new(),
        answer_if_complete: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn range(id: u32, start: usize, end: usize) -> ChunkRange {
        ChunkRange { id, start, end }
    }

    fn result(chunk_id: u32, findings: Vec<Finding>) -> SubWorkerResult {
        SubWorkerResult {
            chunk_id,
            chunk_summary: format!("chunk {chunk_id}"),
            relevant: findings,
            metrics: BTreeMap::new(),
            missing: Vec::new(),
            suggested_next_queries: Vec::new(),
            answer_if_complete: None,
        }
    }

    fn finding(point: &str, evidence: &str, confidence: Confidence) -> Finding {
        Finding {
            point: point.to_string(),
            evidence: evidence.to_string(),
            confidence,
            category: "test".to_string(),
        }
    }

    #[test]
    fn merge_dedups_overlapping_identical_evidence() {
        // Chunks 0 and 1 overlap; both report the same evidence line.
        let outcomes = vec![
            ChunkOutcome {
                range: range(0, 0, 120),
                result: result(0, vec![finding("p0", "shared line", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
            ChunkOutcome {
                range: range(1, 100, 220),
                result: result(1, vec![finding("p1", "shared line", Confidence::High)]),
                provenance: Provenance::Delegated,
            },
        ];

        let buffer = merge(&outcomes);
        assert_eq!(buffer.fragments.len(), 1);
        assert_eq!(buffer.fragments[0].confidence, Confidence::High);
    }

    #[test]
    fn merge_keeps_identical_evidence_from_disjoint_chunks() {
        let outcomes = vec![
            ChunkOutcome {
                range: range(0, 0, 100),
                result: result(0, vec![finding("p0", "same text", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
            ChunkOutcome {
                range: range(1, 100, 200),
                result: result(1, vec![finding("p1", "same text", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
        ];

        let buffer = merge(&outcomes);
        assert_eq!(buffer.fragments.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let outcomes = vec![
            ChunkOutcome {
                range: range(0, 0, 120),
                result: result(0, vec![finding("p0", "ev", Confidence::Medium)]),
                provenance: Provenance::Delegated,
            },
            ChunkOutcome {
                range: range(1, 100, 220),
                result: result(1, vec![finding("p1", "ev", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
        ];

        let once = merge(&outcomes);
        let mut doubled = outcomes.clone();
        doubled.extend(outcomes.clone());
        let twice = merge(&doubled);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_orders_by_chunk_id_regardless_of_arrival() {
        let outcomes = vec![
            ChunkOutcome {
                range: range(2, 200, 300),
                result: result(2, vec![finding("late", "c2", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
            ChunkOutcome {
                range: range(0, 0, 100),
                result: result(0, vec![finding("early", "c0", Confidence::Low)]),
                provenance: Provenance::Delegated,
            },
        ];

        let buffer = merge(&outcomes);
        assert_eq!(buffer.fragments[0].chunk_id, 0);
        assert_eq!(buffer.fragments[1].chunk_id, 2);
    }

    #[test]
    fn finalize_prefers_direct_answer() {
        let mut r = result(0, vec![finding("p", "e", Confidence::Low)]);
        r.answer_if_complete = Some("the answer".to_string());
        let buffer = merge(&[ChunkOutcome {
            range: range(0, 0, 100),
            result: r,
            provenance: Provenance::Delegated,
        }]);

        let answer = finalize(&buffer, "q");
        assert!(answer.complete);
        assert_eq!(answer.text, "the answer");
        // Supporting evidence still present.
        assert_eq!(answer.citations.len(), 1);
    }

    #[test]
    fn finalize_flags_incomplete_and_lists_missing() {
        let mut r = result(0, vec![finding("p", "e", Confidence::Low)]);
        r.missing = vec!["definition of frobnicate".to_string()];
        let buffer = merge(&[ChunkOutcome {
            range: range(0, 0, 100),
            result: r,
            provenance: Provenance::Delegated,
        }]);

        let answer = finalize(&buffer, "q");
        assert!(!answer.complete);
        assert_eq!(answer.missing, vec!["definition of frobnicate".to_string()]);
    }

    #[test]
    fn finalize_high_confidence_is_complete() {
        let buffer = merge(&[ChunkOutcome {
            range: range(0, 0, 100),
            result: result(0, vec![finding("p", "e", Confidence::High)]),
            provenance: Provenance::Delegated,
        }]);

        let answer = finalize(&buffer, "q");
        assert!(answer.complete);
        assert!(answer.missing.is_empty());
    }

    #[test]
    fn recovery_scan_finds_query_terms() {
        let text = "alpha beta\nnothing here\ngamma alpha beta\n";
        let result = recovery_scan(&range(2, 100, 200), text, "alpha beta");
        assert_eq!(result.chunk_id, 2);
        assert_eq!(result.relevant.len(), 2);
        assert_eq!(result.relevant[1].confidence, Confidence::Medium);
        assert_eq!(result.metrics["lines_scanned"], 3);
    }
}
