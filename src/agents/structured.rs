//! Best-effort structured extraction from agent output.
//!
//! JSON is tried first; otherwise the markdown is scanned for known section
//! headings and their bullet points. Bare URLs anywhere in the text become
//! references. Extraction never fails; unparseable output yields an empty
//! [`StructuredOutput`].

use crate::llm::extract_json_object;
use crate::types::StructuredOutput;
use crate::utils::text::strip_bullet;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Findings,
    Uncertainties,
    Suggestions,
    References,
}

fn classify_heading(heading: &str) -> Option<Section> {
    let h = heading
        .trim()
        .trim_end_matches(':')
        .trim_matches('*')
        .to_lowercase()
        .replace(['_', '-'], " ");
    let h = h.trim();
    const FINDINGS: &[&str] = &["key findings", "findings", "results", "key results", "main findings"];
    const UNCERTAINTIES: &[&str] = &[
        "uncertainties",
        "open questions",
        "questions",
        "limitations",
        "unknowns",
        "caveats",
    ];
    const SUGGESTIONS: &[&str] = &[
        "suggestions",
        "recommendations",
        "next steps",
        "action items",
        "future work",
    ];
    const REFERENCES: &[&str] = &["references", "sources", "citations", "bibliography", "links"];

    if FINDINGS.contains(&h) {
        Some(Section::Findings)
    } else if UNCERTAINTIES.contains(&h) {
        Some(Section::Uncertainties)
    } else if SUGGESTIONS.contains(&h) {
        Some(Section::Suggestions)
    } else if REFERENCES.contains(&h) {
        Some(Section::References)
    } else {
        None
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn from_json(text: &str) -> Option<StructuredOutput> {
    let json = extract_json_object(text)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let obj = value.as_object()?;
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k))
            .map(|v| string_list(Some(v)))
            .unwrap_or_default()
    };
    let out = StructuredOutput {
        key_findings: pick(&["key_findings", "findings"]),
        uncertainties: pick(&["uncertainties", "open_questions"]),
        suggestions: pick(&["suggestions", "recommendations"]),
        references: pick(&["references", "sources"]),
    };
    (!out.is_empty()).then_some(out)
}

fn heading_text(line: &str) -> Option<&str> {
    let t = line.trim();
    if t.starts_with('#') {
        return Some(t.trim_start_matches('#').trim());
    }
    // **Findings:** style pseudo-headings
    if t.len() > 4 && t.starts_with("**") && t.ends_with("**") {
        return Some(t.trim_matches('*').trim());
    }
    None
}

fn from_markdown(text: &str) -> StructuredOutput {
    let mut out = StructuredOutput::default();
    let mut current: Option<Section> = None;

    for line in text.lines() {
        if let Some(heading) = heading_text(line) {
            current = classify_heading(heading);
            continue;
        }
        let Some(section) = current else {
            continue;
        };
        let item = strip_bullet(line);
        // Only bulleted or numbered lines count; prose is skipped
        if item.is_empty() || item == line.trim() {
            continue;
        }
        let item = item.to_string();
        match section {
            Section::Findings => out.key_findings.push(item),
            Section::Uncertainties => out.uncertainties.push(item),
            Section::Suggestions => out.suggestions.push(item),
            Section::References => out.references.push(item),
        }
    }
    out
}

/// URLs in order of first appearance
pub fn find_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let Some(start) = word.find("http://").or_else(|| word.find("https://")) else {
            continue;
        };
        let url = word[start..]
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | ']' | '>' | '"' | '\''));
        if url.len() > "https://".len() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// Extract structured output from raw agent text
pub fn extract(text: &str) -> StructuredOutput {
    let mut out = from_json(text).unwrap_or_else(|| from_markdown(text));
    for url in find_urls(text) {
        if !out.references.iter().any(|r| r.contains(url.as_str())) {
            out.references.push(url);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_fenced() {
        let text = "Result:\n```json\n{\"key_findings\": [\"A\", \"B\"], \"uncertainties\": [\"C\"], \
                    \"suggestions\": [], \"references\": [\"arXiv:2312.00752\"]}\n```";
        let out = extract(text);
        assert_eq!(out.key_findings, vec!["A", "B"]);
        assert_eq!(out.uncertainties, vec!["C"]);
        assert!(out.suggestions.is_empty());
        assert_eq!(out.references, vec!["arXiv:2312.00752"]);
    }

    #[test]
    fn test_markdown_sections_with_synonyms() {
        let text = "# Analysis\nIntro text\n\n## Key Findings\n- Mamba is linear\n* Attention is quadratic\n\n\
                    ## Open Questions\n1. Does it scale?\n\n## Recommendations\n- Run ablations\n\n\
                    ## Sources\n- Gu & Dao 2023\n";
        let out = extract(text);
        assert_eq!(out.key_findings, vec!["Mamba is linear", "Attention is quadratic"]);
        assert_eq!(out.uncertainties, vec!["Does it scale?"]);
        assert_eq!(out.suggestions, vec!["Run ablations"]);
        assert_eq!(out.references, vec!["Gu & Dao 2023"]);
    }

    #[test]
    fn test_bare_urls_become_references() {
        let text = "See https://arxiv.org/abs/2312.00752, and (http://example.com/x).";
        let out = extract(text);
        assert!(out.key_findings.is_empty());
        assert_eq!(
            out.references,
            vec!["https://arxiv.org/abs/2312.00752", "http://example.com/x"]
        );
    }

    #[test]
    fn test_unparseable_yields_empty() {
        let out = extract("just some prose with no structure {broken json");
        assert!(out.is_empty());
        assert_eq!(out.confidence(), 0.0);
    }

    #[test]
    fn test_bold_pseudo_headings() {
        let text = "**Findings:**\n- one\n- two\n**Uncertainties**\n- three";
        let out = extract(text);
        assert_eq!(out.key_findings, vec!["one", "two"]);
        assert_eq!(out.uncertainties, vec!["three"]);
    }
}
