//! Archivist: promotes raw output into per-agent digests (L1) and
//! session-wide insights (L2).
//!
//! Both passes are pure functions of what is already on disk. Content carries
//! no timestamps and a write is skipped when the rendered text is unchanged,
//! so re-running a pass without new raw output leaves every file byte-identical.

use super::contradiction::{AttributedPoint, Contradiction, ContradictionDetector, KeywordNegationDetector};
use crate::agents::structured;
use crate::memory::{MemoryEntry, MemoryLayer, MemoryMetadata, MemoryStore, CONTRADICTIONS, KEY_FINDINGS, OPEN_QUESTIONS};
use crate::types::{AppError, Result, StructuredOutput};
use crate::utils::text::{near_duplicate, normalize_whitespace};
use crate::utils::toml_config::ArchivistConfig;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const KEY_POINTS: &str = "Key Points";
const UNCERTAINTIES: &str = "Uncertainties";
const CROSS_REFERENCES: &str = "Cross-References";
const ACTION_ITEMS: &str = "Action Items";

/// Marker separating the model output from the rest of a raw record
const RAW_OUTPUT_MARKER: &str = "\n## Output\n";

/// One agent's digest, section by section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Digest {
    pub agent: String,
    pub key_points: Vec<String>,
    pub uncertainties: Vec<String>,
    pub cross_references: Vec<String>,
    pub action_items: Vec<String>,
}

impl Digest {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Default::default()
        }
    }

    /// Parse a rendered digest; unknown lines are ignored
    pub fn parse(agent: &str, content: &str) -> Self {
        let mut digest = Digest::new(agent);
        let mut section: Option<&str> = None;
        for line in content.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                section = Some(match heading.trim() {
                    KEY_POINTS => KEY_POINTS,
                    UNCERTAINTIES => UNCERTAINTIES,
                    CROSS_REFERENCES => CROSS_REFERENCES,
                    ACTION_ITEMS => ACTION_ITEMS,
                    _ => "",
                });
                continue;
            }
            let Some(point) = line.strip_prefix("- ") else {
                continue;
            };
            let point = point.trim().to_string();
            if point.is_empty() {
                continue;
            }
            match section {
                Some(KEY_POINTS) => digest.key_points.push(point),
                Some(UNCERTAINTIES) => digest.uncertainties.push(point),
                Some(CROSS_REFERENCES) => digest.cross_references.push(point),
                Some(ACTION_ITEMS) => digest.action_items.push(point),
                _ => {}
            }
        }
        digest
    }

    pub fn render(&self) -> String {
        let mut out = format!("# Digest: {}\n", self.agent);
        for (title, points) in [
            (KEY_POINTS, &self.key_points),
            (UNCERTAINTIES, &self.uncertainties),
            (CROSS_REFERENCES, &self.cross_references),
            (ACTION_ITEMS, &self.action_items),
        ] {
            let _ = write!(out, "\n## {}\n", title);
            for point in points {
                let _ = writeln!(out, "- {}", point);
            }
        }
        out
    }

    /// Merge structured output in; returns how many points were added
    pub fn merge(&mut self, output: &StructuredOutput, threshold: f64, cap: usize) -> usize {
        merge_section(&mut self.key_points, &output.key_findings, threshold, cap)
            + merge_section(&mut self.uncertainties, &output.uncertainties, threshold, cap)
            + merge_section(&mut self.cross_references, &output.references, threshold, cap)
            + merge_section(&mut self.action_items, &output.suggestions, threshold, cap)
    }
}

/// Append new points that are not near-duplicates; keep the newest `cap`
fn merge_section(existing: &mut Vec<String>, incoming: &[String], threshold: f64, cap: usize) -> usize {
    let mut added = 0;
    for point in incoming {
        let point = normalize_whitespace(point);
        if point.is_empty() || existing.iter().any(|p| near_duplicate(p, &point, threshold)) {
            continue;
        }
        existing.push(point);
        added += 1;
    }
    if existing.len() > cap {
        let excess = existing.len() - cap;
        existing.drain(..excess);
    }
    added
}

/// Result of an incremental pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestUpdate {
    pub agent: String,
    pub added: usize,
    /// False when the digest was already up to date
    pub written: bool,
}

/// Result of a full pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchivistReport {
    pub digests_read: usize,
    pub findings: usize,
    pub open_questions: usize,
    pub contradictions: Vec<Contradiction>,
    /// L2 keys whose content changed
    pub written: Vec<String>,
}

#[derive(Debug)]
struct Cluster {
    text: String,
    supporters: BTreeSet<String>,
    first_seen: usize,
}

/// Group near-duplicate points, remembering which agents stated them
fn cluster_points<'a>(
    points: impl Iterator<Item = (&'a str, &'a str)>,
    threshold: f64,
) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    for (position, (agent, text)) in points.enumerate() {
        match clusters.iter_mut().find(|c| near_duplicate(&c.text, text, threshold)) {
            Some(cluster) => {
                cluster.supporters.insert(agent.to_string());
            }
            None => clusters.push(Cluster {
                text: text.to_string(),
                supporters: BTreeSet::from([agent.to_string()]),
                first_seen: position,
            }),
        }
    }
    clusters
}

fn agents_label(supporters: &BTreeSet<String>) -> String {
    supporters.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn render_findings(clusters: &[&Cluster]) -> String {
    let mut out = String::from("# Key Findings\n\n");
    if clusters.is_empty() {
        out.push_str("No findings yet.\n");
    }
    for (rank, c) in clusters.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} (supported by {}: {})",
            rank + 1,
            c.text,
            c.supporters.len(),
            agents_label(&c.supporters)
        );
    }
    out
}

fn render_questions(clusters: &[Cluster]) -> String {
    let mut out = String::from("# Open Questions\n\n");
    if clusters.is_empty() {
        out.push_str("No open questions.\n");
    }
    for c in clusters {
        let _ = writeln!(out, "- {} ({})", c.text, agents_label(&c.supporters));
    }
    out
}

fn render_contradictions(found: &[Contradiction]) -> String {
    let mut out = String::from("# Contradictions\n\n");
    if found.is_empty() {
        out.push_str("None detected.\n");
    }
    for c in found {
        let _ = writeln!(
            out,
            "- [{}] {}: \"{}\" vs {}: \"{}\"",
            c.kind, c.agent_a, c.point_a, c.agent_b, c.point_b
        );
    }
    out
}

/// The model output portion of a raw record.
///
/// The recorded offset wins. Without one, the last marker is used: prompt
/// and task text precede the output, so they can never be taken for it.
fn raw_output(entry: &MemoryEntry) -> &str {
    let content = entry.content.as_str();
    if let Some(offset) = entry.metadata.output_offset {
        if let Some(output) = content.get(offset..) {
            return output;
        }
    }
    match content.rfind(RAW_OUTPUT_MARKER) {
        Some(pos) => &content[pos + RAW_OUTPUT_MARKER.len()..],
        None => content,
    }
}

/// Maintains L1 digests and L2 insights for sessions
pub struct Archivist {
    memory: Arc<MemoryStore>,
    detector: Arc<dyn ContradictionDetector>,
    config: ArchivistConfig,
}

impl Archivist {
    pub fn new(memory: Arc<MemoryStore>, config: ArchivistConfig) -> Self {
        Self {
            memory,
            detector: Arc::new(KeywordNegationDetector::new()),
            config,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Incremental pass for one raw record: merge it into its agent's digest
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn update_digest(&self, session_id: &str, raw_key: &str) -> Result<DigestUpdate> {
        let entry = self
            .memory
            .read(session_id, MemoryLayer::Raw, raw_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("raw record '{}'", raw_key)))?;
        let agent = match entry.metadata.agent.clone() {
            Some(agent) => agent,
            None => raw_key
                .rsplit_once('-')
                .map(|(agent, _)| agent.to_string())
                .unwrap_or_else(|| raw_key.to_string()),
        };
        let output = structured::extract(raw_output(&entry));
        self.merge_into_digest(session_id, &agent, &output).await
    }

    /// Merge structured output into `agent`'s digest, writing only on change
    pub async fn merge_into_digest(
        &self,
        session_id: &str,
        agent: &str,
        output: &StructuredOutput,
    ) -> Result<DigestUpdate> {
        let existing = self.memory.read(session_id, MemoryLayer::Digest, agent).await?;
        let previous = existing.as_ref().map(|e| e.content.as_str());
        let mut digest = previous
            .map(|content| Digest::parse(agent, content))
            .unwrap_or_else(|| Digest::new(agent));

        let added = digest.merge(
            output,
            self.config.dedup_threshold,
            self.config.max_points_per_section,
        );
        let rendered = digest.render();
        let written = previous != Some(rendered.as_str());
        if written {
            self.memory
                .write(
                    session_id,
                    MemoryLayer::Digest,
                    agent,
                    &rendered,
                    MemoryMetadata::for_agent(agent).with_tag("digest"),
                )
                .await?;
        }
        debug!(agent, added, written, "digest updated");
        Ok(DigestUpdate {
            agent: agent.to_string(),
            added,
            written,
        })
    }

    /// Full pass: recompute every L2 insight from the current digests
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn full_pass(&self, session_id: &str) -> Result<ArchivistReport> {
        let entries = self.memory.entries(session_id, MemoryLayer::Digest).await?;
        let digests: Vec<Digest> = entries
            .iter()
            .map(|e| Digest::parse(e.metadata.agent.as_deref().unwrap_or(&e.key), &e.content))
            .collect();

        let threshold = self.config.dedup_threshold;
        let mut findings = cluster_points(
            digests
                .iter()
                .flat_map(|d| d.key_points.iter().map(move |p| (d.agent.as_str(), p.as_str()))),
            threshold,
        );
        findings.sort_by(|a, b| {
            b.supporters
                .len()
                .cmp(&a.supporters.len())
                .then(a.first_seen.cmp(&b.first_seen))
        });
        let top: Vec<&Cluster> = findings.iter().take(self.config.max_findings).collect();

        let mut questions = cluster_points(
            digests
                .iter()
                .flat_map(|d| d.uncertainties.iter().map(move |p| (d.agent.as_str(), p.as_str()))),
            threshold,
        );
        questions.truncate(self.config.max_questions);

        let points: Vec<AttributedPoint> = digests
            .iter()
            .flat_map(|d| d.key_points.iter().map(move |p| AttributedPoint::new(&d.agent, p)))
            .collect();
        let contradictions = self.detector.detect(&points);

        let mut report = ArchivistReport {
            digests_read: digests.len(),
            findings: top.len(),
            open_questions: questions.len(),
            contradictions,
            written: Vec::new(),
        };
        let insights = [
            (KEY_FINDINGS, render_findings(&top)),
            (OPEN_QUESTIONS, render_questions(&questions)),
            (CONTRADICTIONS, render_contradictions(&report.contradictions)),
        ];
        for (key, content) in insights {
            if self.write_if_changed(session_id, key, &content).await? {
                report.written.push(key.to_string());
            }
        }

        info!(
            digests = report.digests_read,
            findings = report.findings,
            open_questions = report.open_questions,
            contradictions = report.contradictions.len(),
            detector = self.detector.name(),
            written = report.written.len(),
            "archivist full pass complete"
        );
        Ok(report)
    }

    async fn write_if_changed(&self, session_id: &str, key: &str, content: &str) -> Result<bool> {
        let current = self.memory.read(session_id, MemoryLayer::Insight, key).await?;
        if current.map(|e| e.content == content).unwrap_or(false) {
            return Ok(false);
        }
        self.memory
            .write(
                session_id,
                MemoryLayer::Insight,
                key,
                content,
                MemoryMetadata::for_agent("archivist").with_tag("insight"),
            )
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn output(findings: &[&str], uncertainties: &[&str]) -> StructuredOutput {
        StructuredOutput {
            key_findings: findings.iter().map(|s| s.to_string()).collect(),
            uncertainties: uncertainties.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn archivist(dir: &TempDir) -> Archivist {
        let memory = Arc::new(MemoryStore::new(dir.path()));
        Archivist::new(memory, ArchivistConfig::default())
    }

    #[test]
    fn test_digest_render_parse() {
        let mut digest = Digest::new("explorer");
        digest.merge(&output(&["SSMs scale linearly"], &["Recall on long context"]), 0.8, 50);
        let rendered = digest.render();
        assert!(rendered.starts_with("# Digest: explorer\n\n## Key Points\n- SSMs scale linearly\n"));
        assert_eq!(Digest::parse("explorer", &rendered), digest);
    }

    #[test]
    fn test_merge_drops_near_duplicates_and_caps() {
        let mut digest = Digest::new("explorer");
        let added = digest.merge(
            &output(&["SSMs scale linearly with length", "ssms scale linearly with length."], &[]),
            0.8,
            50,
        );
        assert_eq!(added, 1);

        let many: Vec<String> = (0..5).map(|i| format!("distinct finding number {i}")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let mut capped = Digest::new("critic");
        capped.merge(&output(&refs, &[]), 0.8, 3);
        assert_eq!(
            capped.key_points,
            vec!["distinct finding number 2", "distinct finding number 3", "distinct finding number 4"]
        );
    }

    #[tokio::test]
    async fn test_incremental_pass_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let archivist = archivist(&dir);
        let out = output(&["Mamba is linear"], &[]);

        let first = archivist.merge_into_digest("s", "explorer", &out).await.unwrap();
        assert!(first.written);
        assert_eq!(first.added, 1);
        let path = archivist.memory.path_for("s", MemoryLayer::Digest, "explorer").unwrap();
        let before = std::fs::read(&path).unwrap();

        let second = archivist.merge_into_digest("s", "explorer", &out).await.unwrap();
        assert!(!second.written);
        assert_eq!(second.added, 0);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_digest_reads_raw_output_section() {
        let dir = TempDir::new().unwrap();
        let archivist = archivist(&dir);
        let raw = "# Raw output: critic\n\n## Task\nReview\n\n## Prompt\n## Key Findings\n- prompt noise\n\n\
                   ## Context\ncontext: 0/100\n\n## Output\n## Key Findings\n- Benchmarks are narrow\n";
        archivist
            .memory
            .write("s", MemoryLayer::Raw, "critic-1", raw, MemoryMetadata::for_agent("critic"))
            .await
            .unwrap();

        let update = archivist.update_digest("s", "critic-1").await.unwrap();
        assert_eq!(update.agent, "critic");
        let digest = archivist.memory.read("s", MemoryLayer::Digest, "critic").await.unwrap().unwrap();
        assert!(digest.content.contains("- Benchmarks are narrow"));
        assert!(!digest.content.contains("prompt noise"));
    }

    #[tokio::test]
    async fn test_update_digest_ignores_output_heading_in_prompt() {
        let dir = TempDir::new().unwrap();
        let archivist = archivist(&dir);
        let head = "# Raw output: explorer\n\n## Task\nSurvey\n\n## Prompt\nAnswer in this shape:\n\
                    ## Output\n## Key Findings\n- prompt instruction bullet\n\n\
                    ## Context\ncontext: 0/100\n\n## Output\n";
        let raw = format!("{head}## Key Findings\n- Mamba is linear\n");

        // Offset recorded by the executor
        archivist
            .memory
            .write(
                "s",
                MemoryLayer::Raw,
                "explorer-1",
                &raw,
                MemoryMetadata::for_agent("explorer").with_output_offset(head.len()),
            )
            .await
            .unwrap();
        // Record written without an offset
        archivist
            .memory
            .write("s", MemoryLayer::Raw, "critic-1", &raw, MemoryMetadata::for_agent("critic"))
            .await
            .unwrap();

        for (key, agent) in [("explorer-1", "explorer"), ("critic-1", "critic")] {
            archivist.update_digest("s", key).await.unwrap();
            let digest = archivist.memory.read("s", MemoryLayer::Digest, agent).await.unwrap().unwrap();
            assert!(digest.content.contains("- Mamba is linear"), "{}", digest.content);
            assert!(!digest.content.contains("prompt instruction bullet"), "{}", digest.content);
        }
    }

    #[tokio::test]
    async fn test_full_pass_ranks_by_support_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let archivist = archivist(&dir);
        archivist
            .merge_into_digest("s", "critic", &output(&["Benchmarks are narrow", "Mamba scales linearly with sequence length"], &["Is recall preserved?"]))
            .await
            .unwrap();
        archivist
            .merge_into_digest("s", "explorer", &output(&["Mamba scales linearly with sequence length"], &["Is recall preserved?"]))
            .await
            .unwrap();
        archivist
            .merge_into_digest("s", "logician", &output(&["Mamba does not scale linearly with sequence length"], &[]))
            .await
            .unwrap();

        let report = archivist.full_pass("s").await.unwrap();
        assert_eq!(report.digests_read, 3);
        assert_eq!(report.written.len(), 3);
        assert_eq!(report.open_questions, 1);
        assert!(!report.contradictions.is_empty());

        let findings = archivist.memory.read("s", MemoryLayer::Insight, KEY_FINDINGS).await.unwrap().unwrap();
        let first = findings.content.lines().find(|l| l.starts_with("1. ")).unwrap();
        assert!(first.contains("Mamba scales linearly"), "{first}");
        assert!(first.contains("critic, explorer"), "{first}");

        let snapshot: Vec<Vec<u8>> = [KEY_FINDINGS, OPEN_QUESTIONS, CONTRADICTIONS]
            .iter()
            .map(|k| std::fs::read(archivist.memory.path_for("s", MemoryLayer::Insight, k).unwrap()).unwrap())
            .collect();
        let again = archivist.full_pass("s").await.unwrap();
        assert!(again.written.is_empty());
        for (k, before) in [KEY_FINDINGS, OPEN_QUESTIONS, CONTRADICTIONS].iter().zip(snapshot) {
            let after = std::fs::read(archivist.memory.path_for("s", MemoryLayer::Insight, k).unwrap()).unwrap();
            assert_eq!(after, before);
        }
    }

    #[tokio::test]
    async fn test_contradictions_always_written() {
        let dir = TempDir::new().unwrap();
        let archivist = archivist(&dir);
        archivist
            .merge_into_digest("s", "explorer", &output(&["Attention is quadratic"], &[]))
            .await
            .unwrap();
        archivist.full_pass("s").await.unwrap();
        let entry = archivist.memory.read("s", MemoryLayer::Insight, CONTRADICTIONS).await.unwrap().unwrap();
        assert!(entry.content.contains("None detected."));
    }
}
