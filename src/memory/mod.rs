//! Tiered, file-backed research memory.
//!
//! Each session owns three layers under `{workspace}/{session_id}`:
//!
//! | Layer | Directory | Keyed by | Mutability |
//! |-------|-----------|----------|------------|
//! | L0 raw | `l0_raw/` | one record per agent invocation | write-once |
//! | L1 digest | `l1_digests/` | agent type | rewritten by the archivist |
//! | L2 insight | `l2_insights/` | fixed names (`key_findings`, ...) | rewritten by the archivist |
//!
//! [`MemoryStore`] handles writes and browsing; [`retrieval`] assembles a
//! budgeted [`ContextBundle`] for an agent about to run.

/// Budgeted context assembly and relevance scoring.
pub mod retrieval;
/// File-backed storage with pluggable backends.
pub mod store;

pub use retrieval::{
    ContextBundle, ContextItem, KeywordOverlapScorer, RawRef, RelevanceScorer, RetrievalRequest,
};
pub use store::{FsBackend, MemoryBackend, MemoryEntry, MemoryFileInfo, MemoryMetadata, MemoryStore};

use crate::types::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Approximate bytes per token used by every budget in the crate.
pub const CHARS_PER_TOKEN: usize = 4;

/// L2 record holding the top findings across agents.
pub const KEY_FINDINGS: &str = "key_findings";
/// L2 record holding unresolved questions.
pub const OPEN_QUESTIONS: &str = "open_questions";
/// L2 record holding cross-agent contradictions.
pub const CONTRADICTIONS: &str = "contradictions";

/// Estimates token count for a piece of text (rough approximation).
///
/// Uses a simple heuristic of ~4 bytes per token. Monotonic in length, which
/// is the only property budgets rely on.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Longest char-boundary prefix of `text` whose estimate fits in `tokens`.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> &str {
    let max_bytes = tokens.saturating_mul(CHARS_PER_TOKEN);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// One of the three memory tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayer {
    /// L0: raw agent output, write-once
    Raw,
    /// L1: per-agent digest
    Digest,
    /// L2: session-wide insights
    Insight,
}

impl MemoryLayer {
    pub const ALL: [MemoryLayer; 3] = [MemoryLayer::Raw, MemoryLayer::Digest, MemoryLayer::Insight];

    pub fn dir_name(&self) -> &'static str {
        match self {
            MemoryLayer::Raw => "l0_raw",
            MemoryLayer::Digest => "l1_digests",
            MemoryLayer::Insight => "l2_insights",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MemoryLayer::Raw => "l0",
            MemoryLayer::Digest => "l1",
            MemoryLayer::Insight => "l2",
        }
    }

    /// Whether a write replaces existing content
    pub fn is_mutable(&self) -> bool {
        !matches!(self, MemoryLayer::Raw)
    }
}

impl fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MemoryLayer {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l0" | "raw" | "l0_raw" => Ok(MemoryLayer::Raw),
            "l1" | "digest" | "digests" | "l1_digests" => Ok(MemoryLayer::Digest),
            "l2" | "insight" | "insights" | "l2_insights" => Ok(MemoryLayer::Insight),
            other => Err(AppError::InvalidInput(format!(
                "unknown memory layer '{}' (expected l0, l1 or l2)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("this is a longer test string"), 7);
    }

    #[test]
    fn test_truncate_to_tokens_respects_budget() {
        let text = "abcdefghij";
        assert_eq!(truncate_to_tokens(text, 0), "");
        assert_eq!(truncate_to_tokens(text, 1), "abcd");
        assert_eq!(truncate_to_tokens(text, 3), text);
        for budget in 0..5 {
            assert!(estimate_tokens(truncate_to_tokens(text, budget)) <= budget);
        }
    }

    #[test]
    fn test_truncate_to_tokens_keeps_char_boundaries() {
        // 3-byte chars: a 1-token (4 byte) cut must back off to 3 bytes
        let text = "变换器模型";
        let cut = truncate_to_tokens(text, 1);
        assert_eq!(cut, "变");
    }

    #[test]
    fn test_layer_parse() {
        assert_eq!("L0".parse::<MemoryLayer>().unwrap(), MemoryLayer::Raw);
        assert_eq!("digests".parse::<MemoryLayer>().unwrap(), MemoryLayer::Digest);
        assert_eq!("l2".parse::<MemoryLayer>().unwrap(), MemoryLayer::Insight);
        assert!("l3".parse::<MemoryLayer>().is_err());
        assert!(!MemoryLayer::Raw.is_mutable());
        assert!(MemoryLayer::Insight.is_mutable());
    }
}
