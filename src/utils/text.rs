//! Deterministic text helpers shared by retrieval, preprocessing and the archivist.
//!
//! Everything here is a pure function of its input: no model calls, no
//! randomness, ordered collections only.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "see", "two",
    "who", "did", "get", "him", "let", "say", "she", "too", "use", "with", "this", "that", "from",
    "they", "will", "what", "when", "where", "which", "while", "into", "than", "then", "them",
    "these", "those", "there", "their", "been", "being", "were", "also", "more", "most", "such",
    "some", "only", "over", "each", "very", "about", "between", "both", "does", "should", "would",
    "could", "here", "just", "like", "other", "upon",
];

/// Lowercased alphanumeric keywords longer than two characters, stopwords removed.
///
/// `not` is kept out by the stopword list, so negation checks must look at
/// the raw text (see [`has_negation`]).
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Jaccard similarity of two keyword sets. Two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form used for exact-duplicate checks.
pub fn normalize_point(text: &str) -> String {
    normalize_whitespace(
        &text
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
            .collect::<String>(),
    )
}

/// Two points are near-identical when their canonical forms match or their
/// keyword sets overlap at least `threshold`.
pub fn near_duplicate(a: &str, b: &str, threshold: f64) -> bool {
    let (na, nb) = (normalize_point(a), normalize_point(b));
    if na == nb {
        return true;
    }
    jaccard(&keywords(a), &keywords(b)) >= threshold
}

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "cannot", "can't", "doesn't", "don't", "isn't", "aren't", "wasn't",
    "won't", "fails", "failed", "lacks", "neither", "nor", "without", "unable", "unlikely",
];

/// Whether the text carries an explicit negation word.
pub fn has_negation(text: &str) -> bool {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | ';' | ':' | '(' | ')'))
        .map(|w| w.to_lowercase())
        .any(|w| NEGATIONS.contains(&w.as_str()))
}

/// Numbers mentioned in the text, in order of appearance.
pub fn numbers(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty()) {
            current.push(c);
        } else if !current.is_empty() {
            out.push(current.trim_end_matches('.').to_string());
            current.clear();
        }
    }
    if !current.is_empty() {
        out.push(current.trim_end_matches('.').to_string());
    }
    out
}

/// Strip a leading markdown bullet or ordinal (`- `, `* `, `1. `, `2) `).
pub fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim();
    for prefix in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest.trim();
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    trimmed
}
