//! Contradiction detection across agent digests.
//!
//! Finds conflicting points from different agents using keyword overlap,
//! negation and numeric checks.

use crate::utils::text::{has_negation, jaccard, keywords, normalize_point, numbers};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// A point tagged with the agent whose digest holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedPoint {
    pub agent: String,
    pub text: String,
}

impl AttributedPoint {
    pub fn new(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            text: text.into(),
        }
    }
}

/// Type of contradiction between two points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionKind {
    /// One side asserts what the other negates.
    DirectNegation,
    /// Same subject, different figures.
    NumericDisagreement,
}

impl fmt::Display for ContradictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContradictionKind::DirectNegation => "negation",
            ContradictionKind::NumericDisagreement => "numeric",
        })
    }
}

/// A detected contradiction; `a` sorts before `b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub agent_a: String,
    pub point_a: String,
    pub agent_b: String,
    pub point_b: String,
    pub kind: ContradictionKind,
    /// Keyword overlap of the two points
    pub overlap: f64,
}

/// Pluggable contradiction detection over attributed points.
///
/// Implementations must be deterministic: the archivist relies on identical
/// input producing identical output.
pub trait ContradictionDetector: Send + Sync {
    fn detect(&self, points: &[AttributedPoint]) -> Vec<Contradiction>;

    fn name(&self) -> &str;
}

/// Flags pairs from different agents that overlap on keywords and disagree
/// on negation or on the numbers they state.
#[derive(Debug, Clone)]
pub struct KeywordNegationDetector {
    /// Minimum keyword overlap to consider two points about the same subject.
    min_overlap: f64,
}

impl KeywordNegationDetector {
    pub fn new() -> Self {
        Self { min_overlap: 0.3 }
    }

    pub fn with_min_overlap(min_overlap: f64) -> Self {
        Self { min_overlap }
    }

    fn check_pair(&self, a: &AttributedPoint, b: &AttributedPoint) -> Option<(ContradictionKind, f64)> {
        let overlap = jaccard(&keywords(&a.text), &keywords(&b.text));
        if overlap < self.min_overlap {
            return None;
        }

        if has_negation(&a.text) != has_negation(&b.text) {
            return Some((ContradictionKind::DirectNegation, overlap));
        }

        let nums_a: BTreeSet<String> = numbers(&a.text).into_iter().collect();
        let nums_b: BTreeSet<String> = numbers(&b.text).into_iter().collect();
        if !nums_a.is_empty() && !nums_b.is_empty() && nums_a != nums_b {
            return Some((ContradictionKind::NumericDisagreement, overlap));
        }
        None
    }
}

impl Default for KeywordNegationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ContradictionDetector for KeywordNegationDetector {
    fn detect(&self, points: &[AttributedPoint]) -> Vec<Contradiction> {
        let mut found = Vec::new();
        for i in 0..points.len() {
            for j in (i + 1)..points.len() {
                let (a, b) = (&points[i], &points[j]);
                if a.agent == b.agent {
                    continue;
                }
                let Some((kind, overlap)) = self.check_pair(a, b) else {
                    continue;
                };
                let (first, second) = if (&a.agent, &a.text) <= (&b.agent, &b.text) {
                    (a, b)
                } else {
                    (b, a)
                };
                found.push(Contradiction {
                    agent_a: first.agent.clone(),
                    point_a: first.text.clone(),
                    agent_b: second.agent.clone(),
                    point_b: second.text.clone(),
                    kind,
                    overlap,
                });
            }
        }

        // Sort before dedup so the surviving copy does not depend on input order
        found.sort_by(|x, y| {
            (&x.agent_a, &x.agent_b, &x.point_a, &x.point_b)
                .cmp(&(&y.agent_a, &y.agent_b, &y.point_a, &y.point_b))
        });
        let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
        found.retain(|c| {
            let pair: BTreeSet<String> = [normalize_point(&c.point_a), normalize_point(&c.point_b)]
                .into_iter()
                .collect();
            seen.insert(pair)
        });
        found
    }

    fn name(&self) -> &str {
        "keyword_negation"
    }
}
