//! Local context cleanup run before the model call.

use super::profile::{CleanupTask, PreprocessingConfig};
use crate::memory::{estimate_tokens, truncate_to_tokens};
use crate::utils::text::{jaccard, keywords, normalize_point, normalize_whitespace};
use std::collections::{BTreeSet, HashSet};

/// Lines whose keyword sets overlap this much are treated as duplicates
const NEAR_DUPLICATE_THRESHOLD: f64 = 0.9;
/// Lines shorter than this (after trimming) are noise, unless headings or bullets
const MIN_LINE_CHARS: usize = 4;

/// Cleaned context with a record of what changed
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessed {
    pub text: String,
    pub tokens: usize,
    pub lines_in: usize,
    pub lines_out: usize,
    pub truncated: bool,
}

/// Apply the configured cleanup tasks in order, then cap at
/// `max_output_tokens`.
pub fn preprocess(context: &str, task_description: &str, config: &PreprocessingConfig) -> Preprocessed {
    let mut lines: Vec<String> = context.lines().map(str::to_string).collect();
    let lines_in = lines.len();

    for task in &config.tasks {
        lines = match task {
            CleanupTask::Deduplication => deduplicate(lines),
            CleanupTask::NoiseReduction => reduce_noise(lines),
            CleanupTask::ImportanceRanking => rank_by_importance(lines, task_description),
        };
    }

    let lines_out = lines.len();
    let joined = lines.join("\n");
    let capped = truncate_to_tokens(&joined, config.max_output_tokens);
    let truncated = capped.len() < joined.len();
    Preprocessed {
        tokens: estimate_tokens(capped),
        text: capped.to_string(),
        lines_in,
        lines_out,
        truncated,
    }
}

fn is_structural(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#')
}

/// Drop exact repeats and near-duplicate lines; headings and blanks pass through
fn deduplicate(lines: Vec<String>) -> Vec<String> {
    let mut seen_exact: HashSet<String> = HashSet::new();
    let mut seen_keywords: Vec<BTreeSet<String>> = Vec::new();
    let mut out = Vec::with_capacity(lines.len());

    for line in lines {
        if line.trim().is_empty() || is_structural(&line) {
            out.push(line);
            continue;
        }
        let canonical = normalize_point(&line);
        if !seen_exact.insert(canonical) {
            continue;
        }
        let kw = keywords(&line);
        if !kw.is_empty()
            && seen_keywords
                .iter()
                .any(|seen| jaccard(seen, &kw) >= NEAR_DUPLICATE_THRESHOLD)
        {
            continue;
        }
        seen_keywords.push(kw);
        out.push(line);
    }
    out
}

/// Drop blank, separator and very short lines; collapse whitespace
fn reduce_noise(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter_map(|line| {
            let collapsed = normalize_whitespace(&line);
            if collapsed.is_empty() {
                return None;
            }
            if collapsed.chars().all(|c| matches!(c, '-' | '=' | '*' | '_' | '~' | ' ' | '|')) {
                return None;
            }
            if !is_structural(&collapsed) && collapsed.chars().count() < MIN_LINE_CHARS {
                return None;
            }
            Some(collapsed)
        })
        .collect()
}

/// Stable sort by keyword overlap with the task; ties keep original order
fn rank_by_importance(lines: Vec<String>, task_description: &str) -> Vec<String> {
    let query = keywords(task_description);
    if query.is_empty() {
        return lines;
    }
    let mut scored: Vec<(usize, String)> = lines
        .into_iter()
        .map(|line| {
            let hits = keywords(&line).intersection(&query).count();
            (hits, line)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, line)| line).collect()
}
