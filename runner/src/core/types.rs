//! Shared deterministic types for the analysis read path.
//!
//! These types define the stable contract between the sub-worker dispatcher
//! and the synthesizer. They must not depend on external state or I/O and
//! must remain deterministic across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sub-worker confidence tag for a single finding.
///
/// Ordering matters: duplicate findings keep the highest confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// One finding extracted from a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// What the sub-worker concluded.
    pub point: String,
    /// Verbatim text from the chunk supporting the point.
    pub evidence: String,
    pub confidence: Confidence,
    /// Free-form category label (e.g. "definition", "usage").
    pub category: String,
}

/// Structured output of analyzing one chunk.
///
/// Every field is required on the wire; a result missing any of them is
/// classified malformed by the dispatcher, not parsed leniently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkerResult {
    pub chunk_id: u32,
    pub chunk_summary: String,
    /// Findings relevant to the query, in chunk order.
    pub relevant: Vec<Finding>,
    /// Counters reported by the sub-worker (lines scanned, matches, ...).
    pub metrics: BTreeMap<String, u64>,
    /// Things the sub-worker could not resolve within its chunk.
    pub missing: Vec<String>,
    /// Follow-up queries the sub-worker suggests.
    pub suggested_next_queries: Vec<String>,
    /// Set when the chunk alone fully answers the query.
    pub answer_if_complete: Option<String>,
}

/// How a chunk's findings were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Produced by a dispatched sub-worker.
    Delegated,
    /// Produced by the in-process recovery scan after a dispatch failure.
    Recovered,
}
