//! Budgeted context assembly.
//!
//! A [`ContextBundle`] is filled in three passes (L2 insights, then L1
//! digests by relevance, then references to matching L0 files) under a
//! single token budget. Items that fit are taken whole; the first item that
//! does not fit is cut to the remaining budget and filling stops. A smaller
//! budget therefore always yields a prefix of a larger one.

use super::store::MemoryEntry;
use super::{estimate_tokens, truncate_to_tokens, MemoryLayer};
use crate::utils::text::keywords;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Scores how relevant a document is to a query, in `[0, 1]`.
///
/// Implementations must be deterministic: equal inputs give equal scores.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, content: &str) -> f64;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Fraction of query keywords that also appear in the document
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordOverlapScorer;

impl RelevanceScorer for KeywordOverlapScorer {
    fn score(&self, query: &str, content: &str) -> f64 {
        let query = keywords(query);
        if query.is_empty() {
            return 0.0;
        }
        let doc = keywords(content);
        let hits = query.iter().filter(|k| doc.contains(*k)).count();
        hits as f64 / query.len() as f64
    }

    fn name(&self) -> &str {
        "keyword-overlap"
    }
}

/// Parameters for one retrieval
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub session_id: String,
    /// The requester's own digest is never returned to it
    pub requesting_agent: String,
    pub query: String,
    pub token_budget: usize,
    /// Insight keys placed first, in this order
    pub default_insights: Vec<String>,
    /// Restrict insights to these keys; `None` means every insight
    pub insight_keys: Option<Vec<String>>,
    /// Restrict digests to these agents; `None` means every agent
    pub eligible_digests: Option<Vec<String>>,
    /// Rank digests by relevance (and apply `top_k`) instead of key order
    pub semantic_search: bool,
    pub top_k: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(
        session_id: impl Into<String>,
        requesting_agent: impl Into<String>,
        query: impl Into<String>,
        token_budget: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            requesting_agent: requesting_agent.into(),
            query: query.into(),
            token_budget,
            default_insights: Vec::new(),
            insight_keys: None,
            eligible_digests: None,
            semantic_search: true,
            top_k: None,
        }
    }

    pub fn with_default_insights(mut self, keys: Vec<String>) -> Self {
        self.default_insights = keys;
        self
    }

    pub fn with_insight_keys(mut self, keys: Vec<String>) -> Self {
        self.insight_keys = Some(keys);
        self
    }

    pub fn with_eligible_digests(mut self, agents: Vec<String>) -> Self {
        self.eligible_digests = Some(agents);
        self
    }

    pub fn with_semantic_search(mut self, enabled: bool, top_k: Option<usize>) -> Self {
        self.semantic_search = enabled;
        self.top_k = top_k;
        self
    }
}

/// A piece of memory content included in a bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub key: String,
    pub layer: MemoryLayer,
    pub content: String,
    pub tokens: usize,
    /// Content was cut to fit the budget
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Reference to an L0 file; the content itself is not loaded into context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRef {
    pub key: String,
    pub path: PathBuf,
    pub score: f64,
    pub tokens: usize,
}

/// The result of a budgeted retrieval
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub insights: Vec<ContextItem>,
    pub digests: Vec<ContextItem>,
    pub raw_refs: Vec<RawRef>,
    pub token_budget: usize,
    pub tokens_used: usize,
    /// Some content was cut or left out for lack of budget
    pub truncated: bool,
    /// Some memory could not be read
    pub degraded: bool,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.insights.is_empty() && self.digests.is_empty() && self.raw_refs.is_empty()
    }

    /// Items in fill order, insights then digests
    pub fn items(&self) -> impl Iterator<Item = &ContextItem> {
        self.insights.iter().chain(self.digests.iter())
    }

    /// Render as prompt context
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.insights.is_empty() {
            out.push_str("## Research Insights\n\n");
            for item in &self.insights {
                let _ = writeln!(out, "### {}\n\n{}\n", item.key, item.content.trim_end());
            }
        }
        if !self.digests.is_empty() {
            out.push_str("## Other Agents' Digests\n\n");
            for item in &self.digests {
                let _ = writeln!(out, "### {}\n\n{}\n", item.key, item.content.trim_end());
            }
        }
        if !self.raw_refs.is_empty() {
            out.push_str("## Related Raw Outputs\n\n");
            for r in &self.raw_refs {
                let _ = writeln!(out, "- {}", r.path.display());
            }
        }
        out
    }

    /// One-line-per-item listing of keys and token counts
    pub fn summary(&self) -> String {
        let mut out = format!(
            "context: {}/{} tokens{}{}\n",
            self.tokens_used,
            self.token_budget,
            if self.truncated { ", truncated" } else { "" },
            if self.degraded { ", degraded" } else { "" },
        );
        for item in self.items() {
            let _ = writeln!(
                out,
                "- {}/{} ({} tokens{})",
                item.layer,
                item.key,
                item.tokens,
                if item.truncated { ", truncated" } else { "" }
            );
        }
        for r in &self.raw_refs {
            let _ = writeln!(out, "- ref {} ({:.2})", r.path.display(), r.score);
        }
        out
    }

    /// Whether this bundle is the start of `other`: same items in the same
    /// order, where this bundle's last item may be a shortened version.
    pub fn is_prefix_of(&self, other: &ContextBundle) -> bool {
        fn items_prefix(short: &[ContextItem], long: &[ContextItem]) -> bool {
            if short.len() > long.len() {
                return false;
            }
            short.iter().zip(long).all(|(a, b)| {
                a.key == b.key && a.layer == b.layer && b.content.starts_with(a.content.as_str())
            })
        }

        let mine: Vec<ContextItem> = self.items().cloned().collect();
        let theirs: Vec<ContextItem> = other.items().cloned().collect();
        if !items_prefix(&mine, &theirs) {
            return false;
        }
        // Only the last item may be shortened
        let shortened = mine
            .iter()
            .zip(&theirs)
            .filter(|(a, b)| a.content.len() != b.content.len())
            .count();
        if shortened > 1 {
            return false;
        }
        if shortened == 1 {
            let last = mine.len() - 1;
            if mine[last].content.len() == theirs[last].content.len() {
                return false;
            }
            if !self.raw_refs.is_empty() {
                return false;
            }
        }
        if !self.raw_refs.is_empty() && mine.len() != theirs.len() {
            return false;
        }
        self.raw_refs.len() <= other.raw_refs.len()
            && self
                .raw_refs
                .iter()
                .zip(&other.raw_refs)
                .all(|(a, b)| a.path == b.path)
    }
}

/// Stop-on-first-overflow filler
struct Filler {
    remaining: usize,
    stopped: bool,
    truncated: bool,
}

impl Filler {
    fn new(budget: usize) -> Self {
        Self {
            remaining: budget,
            stopped: false,
            truncated: false,
        }
    }

    fn take(
        &mut self,
        key: &str,
        layer: MemoryLayer,
        content: &str,
        score: Option<f64>,
    ) -> Option<ContextItem> {
        if self.stopped {
            self.truncated = true;
            return None;
        }
        let tokens = estimate_tokens(content);
        if tokens <= self.remaining {
            self.remaining -= tokens;
            return Some(ContextItem {
                key: key.to_string(),
                layer,
                content: content.to_string(),
                tokens,
                truncated: false,
                score,
            });
        }

        self.stopped = true;
        self.truncated = true;
        let cut = truncate_to_tokens(content, self.remaining);
        if cut.is_empty() {
            return None;
        }
        let tokens = estimate_tokens(cut);
        self.remaining = self.remaining.saturating_sub(tokens);
        Some(ContextItem {
            key: key.to_string(),
            layer,
            content: cut.to_string(),
            tokens,
            truncated: true,
            score,
        })
    }

    fn take_ref(&mut self, entry: &MemoryEntry, score: f64) -> Option<RawRef> {
        if self.stopped {
            self.truncated = true;
            return None;
        }
        let tokens = estimate_tokens(&entry.path.to_string_lossy());
        if tokens > self.remaining {
            self.stopped = true;
            self.truncated = true;
            return None;
        }
        self.remaining -= tokens;
        Some(RawRef {
            key: entry.key.clone(),
            path: entry.path.clone(),
            score,
            tokens,
        })
    }
}

fn by_score_then_key(a: &(f64, &MemoryEntry), b: &(f64, &MemoryEntry)) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.1.key.cmp(&b.1.key))
}

/// Order insights: `default_insights` first (in their order), the rest by key
fn order_insights<'a>(request: &RetrievalRequest, insights: &'a [MemoryEntry]) -> Vec<&'a MemoryEntry> {
    let allowed = |key: &str| {
        request
            .insight_keys
            .as_ref()
            .map(|keys| keys.iter().any(|k| k == key))
            .unwrap_or(true)
    };
    let by_key: HashMap<&str, &MemoryEntry> =
        insights.iter().map(|e| (e.key.as_str(), e)).collect();

    let mut ordered: Vec<&MemoryEntry> = Vec::with_capacity(insights.len());
    for key in &request.default_insights {
        if let Some(entry) = by_key.get(key.as_str()) {
            if allowed(key) && !ordered.iter().any(|e| e.key == entry.key) {
                ordered.push(entry);
            }
        }
    }
    let mut rest: Vec<&MemoryEntry> = insights
        .iter()
        .filter(|e| allowed(&e.key) && !ordered.iter().any(|o| o.key == e.key))
        .collect();
    rest.sort_by(|a, b| a.key.cmp(&b.key));
    ordered.extend(rest);
    ordered
}

/// Fill a bundle from already-loaded layers
pub(crate) fn assemble(
    request: &RetrievalRequest,
    scorer: &dyn RelevanceScorer,
    insights: &[MemoryEntry],
    digests: &[MemoryEntry],
    raw: &[MemoryEntry],
) -> ContextBundle {
    let mut filler = Filler::new(request.token_budget);
    let mut bundle = ContextBundle {
        token_budget: request.token_budget,
        ..Default::default()
    };

    for entry in order_insights(request, insights) {
        if let Some(item) = filler.take(&entry.key, MemoryLayer::Insight, &entry.content, None) {
            bundle.insights.push(item);
        }
    }

    let eligible = |agent: &str| {
        agent != request.requesting_agent
            && request
                .eligible_digests
                .as_ref()
                .map(|list| list.iter().any(|a| a == agent))
                .unwrap_or(true)
    };
    let mut ranked: Vec<(f64, &MemoryEntry)> = digests
        .iter()
        .filter(|e| eligible(&e.key))
        .map(|e| (scorer.score(&request.query, &e.content), e))
        .collect();
    if request.semantic_search {
        ranked.sort_by(by_score_then_key);
        if let Some(k) = request.top_k {
            ranked.truncate(k);
        }
    } else {
        ranked.sort_by(|a, b| a.1.key.cmp(&b.1.key));
    }
    for (score, entry) in ranked {
        if let Some(item) = filler.take(&entry.key, MemoryLayer::Digest, &entry.content, Some(score)) {
            bundle.digests.push(item);
        }
    }

    if !filler.stopped && filler.remaining > 0 {
        let mut matches: Vec<(f64, &MemoryEntry)> = raw
            .iter()
            .map(|e| (scorer.score(&request.query, &e.content), e))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        matches.sort_by(by_score_then_key);
        for (score, entry) in matches {
            match filler.take_ref(entry, score) {
                Some(r) => bundle.raw_refs.push(r),
                None => break,
            }
        }
    }

    bundle.tokens_used = request.token_budget - filler.remaining;
    bundle.truncated = filler.truncated;
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMetadata, MemoryStore};
    use std::path::Path;

    fn entry(layer: MemoryLayer, key: &str, content: &str) -> MemoryEntry {
        MemoryEntry {
            layer,
            key: key.to_string(),
            content: content.to_string(),
            metadata: MemoryMetadata::default(),
            path: Path::new("/ws/s").join(layer.dir_name()).join(format!("{key}.md")),
        }
    }

    fn fixture() -> (Vec<MemoryEntry>, Vec<MemoryEntry>, Vec<MemoryEntry>) {
        let insights = vec![
            entry(MemoryLayer::Insight, "contradictions", "none detected"),
            entry(
                MemoryLayer::Insight,
                "key_findings",
                "Transformers dominate long context benchmarks.",
            ),
            entry(MemoryLayer::Insight, "open_questions", "Do state space models scale?"),
        ];
        let digests = vec![
            entry(MemoryLayer::Digest, "critic", "Benchmarks for transformers are contested."),
            entry(MemoryLayer::Digest, "explorer", "Found twelve papers on state space models."),
            entry(MemoryLayer::Digest, "logician", "Scaling laws for transformers hold."),
        ];
        let raw = vec![
            entry(MemoryLayer::Raw, "explorer-1", "state space models mamba"),
            entry(MemoryLayer::Raw, "critic-1", "unrelated text about cooking"),
        ];
        (insights, digests, raw)
    }

    fn request(budget: usize) -> RetrievalRequest {
        RetrievalRequest::new("s", "explorer", "transformers state space models", budget)
            .with_default_insights(vec!["key_findings".into()])
    }

    #[test]
    fn test_keyword_overlap_scorer() {
        let scorer = KeywordOverlapScorer;
        assert_eq!(scorer.score("", "anything"), 0.0);
        assert_eq!(scorer.score("transformer models", "Transformer models rock"), 1.0);
        assert_eq!(scorer.score("transformer models", "only models here"), 0.5);
        assert_eq!(scorer.score("transformer", "nothing"), 0.0);
    }

    #[test]
    fn test_fill_order_and_exclusions() {
        let (insights, digests, raw) = fixture();
        let bundle = assemble(&request(10_000), &KeywordOverlapScorer, &insights, &digests, &raw);

        let insight_keys: Vec<_> = bundle.insights.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(insight_keys, vec!["key_findings", "contradictions", "open_questions"]);

        let digest_keys: Vec<_> = bundle.digests.iter().map(|i| i.key.as_str()).collect();
        assert!(!digest_keys.contains(&"explorer"));
        assert_eq!(digest_keys.len(), 2);

        assert_eq!(bundle.raw_refs.len(), 1);
        assert_eq!(bundle.raw_refs[0].key, "explorer-1");
        assert!(!bundle.truncated);
        assert!(bundle.tokens_used <= bundle.token_budget);
    }

    #[test]
    fn test_digests_ranked_by_score_then_key() {
        let (insights, digests, raw) = fixture();
        let req = RetrievalRequest::new("s", "nobody", "transformers scaling laws", 10_000);
        let bundle = assemble(&req, &KeywordOverlapScorer, &insights, &digests, &raw);
        let keys: Vec<_> = bundle.digests.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["logician", "critic", "explorer"]);

        let limited = assemble(
            &req.clone().with_semantic_search(true, Some(1)),
            &KeywordOverlapScorer,
            &insights,
            &digests,
            &raw,
        );
        assert_eq!(limited.digests.len(), 1);

        let unranked = assemble(
            &req.with_semantic_search(false, Some(1)),
            &KeywordOverlapScorer,
            &insights,
            &digests,
            &raw,
        );
        let keys: Vec<_> = unranked.digests.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["critic", "explorer", "logician"]);
    }

    #[test]
    fn test_zero_budget_yields_nothing() {
        let (insights, digests, raw) = fixture();
        let bundle = assemble(&request(0), &KeywordOverlapScorer, &insights, &digests, &raw);
        assert!(bundle.is_empty());
        assert_eq!(bundle.tokens_used, 0);
        assert!(bundle.truncated);
    }

    #[test]
    fn test_oversized_insight_is_truncated_and_stops_fill() {
        let (insights, digests, raw) = fixture();
        let bundle = assemble(&request(5), &KeywordOverlapScorer, &insights, &digests, &raw);
        assert_eq!(bundle.insights.len(), 1);
        assert!(bundle.insights[0].truncated);
        assert_eq!(bundle.insights[0].tokens, 5);
        assert!(bundle.digests.is_empty());
        assert!(bundle.raw_refs.is_empty());
    }

    #[test]
    fn test_smaller_budget_is_prefix_of_larger() {
        let (insights, digests, raw) = fixture();
        let full = assemble(&request(10_000), &KeywordOverlapScorer, &insights, &digests, &raw);
        let mut previous_used = 0;
        for budget in 0..=full.tokens_used + 5 {
            let bundle = assemble(&request(budget), &KeywordOverlapScorer, &insights, &digests, &raw);
            assert!(bundle.tokens_used <= budget);
            assert!(bundle.tokens_used >= previous_used, "budget {budget}");
            assert!(bundle.is_prefix_of(&full), "budget {budget}");
            previous_used = bundle.tokens_used;
        }
    }

    #[test]
    fn test_insight_keys_restrict_selection() {
        let (insights, digests, raw) = fixture();
        let req = request(10_000).with_insight_keys(vec!["open_questions".into()]);
        let bundle = assemble(&req, &KeywordOverlapScorer, &insights, &digests, &raw);
        let keys: Vec<_> = bundle.insights.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["open_questions"]);
    }

    #[test]
    fn test_render_and_summary() {
        let (insights, digests, raw) = fixture();
        let bundle = assemble(&request(10_000), &KeywordOverlapScorer, &insights, &digests, &raw);
        let rendered = bundle.render();
        assert!(rendered.contains("## Research Insights"));
        assert!(rendered.contains("### key_findings"));
        assert!(rendered.contains("explorer-1.md"));
        let summary = bundle.summary();
        assert!(summary.starts_with("context: "));
        assert!(summary.contains("l2/key_findings"));
    }

    #[tokio::test]
    async fn test_store_retrieve_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.init_session("s1").await.unwrap();
        store
            .write("s1", MemoryLayer::Insight, "key_findings", "Attention is key.", MemoryMetadata::default())
            .await
            .unwrap();
        store
            .write("s1", MemoryLayer::Digest, "explorer", "Attention papers found.", MemoryMetadata::default())
            .await
            .unwrap();
        store
            .write("s1", MemoryLayer::Digest, "critic", "Attention claims disputed.", MemoryMetadata::default())
            .await
            .unwrap();

        let bundle = store.retrieve("s1", "explorer", "attention", 1000).await;
        assert_eq!(bundle.insights.len(), 1);
        assert_eq!(bundle.digests.len(), 1);
        assert_eq!(bundle.digests[0].key, "critic");
        assert!(!bundle.degraded);

        let empty = store.retrieve("missing", "explorer", "attention", 1000).await;
        assert!(empty.is_empty());
        assert!(!empty.degraded);
    }
}
