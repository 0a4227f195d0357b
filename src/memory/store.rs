//! File-backed memory store.
//!
//! Content lives in `{key}.md`; metadata (agent, task, tags, content hash,
//! modification time) in a `{key}.meta.json` sidecar. Writes go through the
//! [`MemoryBackend`], whose filesystem implementation replaces files via
//! temp-file + rename so concurrent readers never see a torn record.

use super::retrieval::{self, ContextBundle, KeywordOverlapScorer, RelevanceScorer, RetrievalRequest};
use super::MemoryLayer;
use crate::types::{AppError, Result};
use crate::utils::toml_config::MemoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONTENT_EXT: &str = "md";
const META_SUFFIX: &str = ".meta.json";
const MAX_KEY_LEN: usize = 120;

/// Storage primitive the store is built on
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Replace `path` with `content`, creating parent directories
    async fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    async fn read(&self, path: &Path) -> io::Result<String>;

    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Files directly inside `dir`; a missing directory lists as empty
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// Local filesystem backend over `tokio::fs`
#[derive(Debug, Default, Clone)]
pub struct FsBackend;

#[async_trait]
impl MemoryBackend for FsBackend {
    async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    async fn read(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }
}

/// Sidecar metadata stored next to each record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Byte offset where the model output starts in a raw record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_offset: Option<usize>,
    /// Filled in by the store on write
    #[serde(default)]
    pub content_sha256: String,
    /// Filled in by the store on write
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemoryMetadata {
    pub fn for_agent(agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_output_offset(mut self, offset: usize) -> Self {
        self.output_offset = Some(offset);
        self
    }
}

/// One stored record
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub layer: MemoryLayer,
    pub key: String,
    pub content: String,
    pub metadata: MemoryMetadata,
    pub path: PathBuf,
}

/// Browsing projection of a record (no content)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryFileInfo {
    pub layer: MemoryLayer,
    pub key: String,
    pub path: PathBuf,
    pub size: usize,
    pub agent: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-session tiered memory
pub struct MemoryStore {
    root: PathBuf,
    backend: Arc<dyn MemoryBackend>,
    scorer: Arc<dyn RelevanceScorer>,
    write_retries: u32,
    retry_backoff: Duration,
}

impl MemoryStore {
    /// Filesystem-backed store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: Arc::new(FsBackend),
            scorer: Arc::new(KeywordOverlapScorer),
            write_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.workspace.clone())
            .with_write_retries(config.write_retries, Duration::from_millis(config.retry_backoff_ms))
    }

    pub fn with_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_write_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.write_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scorer(&self) -> &dyn RelevanceScorer {
        self.scorer.as_ref()
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn layer_dir(&self, session_id: &str, layer: MemoryLayer) -> PathBuf {
        self.session_dir(session_id).join(layer.dir_name())
    }

    /// Path of the content file for `(layer, key)`
    pub fn path_for(&self, session_id: &str, layer: MemoryLayer, key: &str) -> Result<PathBuf> {
        let key = sanitize_key(key)?;
        Ok(self
            .layer_dir(session_id, layer)
            .join(format!("{}.{}", key, CONTENT_EXT)))
    }

    /// Create the session's layer directories.
    ///
    /// Failure here means the store is unreachable for this session.
    pub async fn init_session(&self, session_id: &str) -> Result<PathBuf> {
        for layer in MemoryLayer::ALL {
            let dir = self.layer_dir(session_id, layer);
            self.backend.create_dir_all(&dir).await.map_err(|e| {
                AppError::Memory(format!(
                    "memory workspace unreachable at {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(self.session_dir(session_id))
    }

    /// Write a record.
    ///
    /// L0 records are write-once: a second write to the same key fails.
    /// L1/L2 records are replaced, last writer wins. Transient I/O failures
    /// are retried with jittered backoff before surfacing a `Memory` error.
    pub async fn write(
        &self,
        session_id: &str,
        layer: MemoryLayer,
        key: &str,
        content: &str,
        metadata: MemoryMetadata,
    ) -> Result<PathBuf> {
        let path = self.path_for(session_id, layer, key)?;

        if !layer.is_mutable() {
            let exists = self
                .backend
                .exists(&path)
                .await
                .map_err(|e| AppError::Memory(format!("cannot stat {}: {}", path.display(), e)))?;
            if exists {
                return Err(AppError::Memory(format!(
                    "raw record '{}' already exists and is write-once",
                    key
                )));
            }
        }

        let mut metadata = metadata;
        metadata.content_sha256 = content_hash(content);
        metadata.updated_at = Some(Utc::now());
        let meta_json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| AppError::Internal(format!("metadata serialization failed: {}", e)))?;
        let meta_path = meta_path(&path);

        let attempts = self.write_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = async {
                self.backend.write(&path, content).await?;
                self.backend.write(&meta_path, &meta_json).await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(
                        session_id,
                        layer = %layer,
                        key,
                        bytes = content.len(),
                        "memory record written"
                    );
                    return Ok(path);
                }
                Err(e) => {
                    warn!(
                        session_id,
                        layer = %layer,
                        key,
                        attempt,
                        attempts,
                        error = %e,
                        "memory write failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(AppError::Memory(format!(
            "write of {} '{}' failed after {} attempts: {}",
            layer,
            key,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.saturating_mul(attempt);
        let jitter_ceiling = (self.retry_backoff.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::random_range(0..jitter_ceiling))
    }

    /// Read one record, `None` if it does not exist
    pub async fn read(
        &self,
        session_id: &str,
        layer: MemoryLayer,
        key: &str,
    ) -> Result<Option<MemoryEntry>> {
        let path = self.path_for(session_id, layer, key)?;
        let exists = self
            .backend
            .exists(&path)
            .await
            .map_err(|e| AppError::Memory(format!("cannot stat {}: {}", path.display(), e)))?;
        if !exists {
            return Ok(None);
        }
        self.load_entry(layer, &path).await.map(Some)
    }

    async fn load_entry(&self, layer: MemoryLayer, path: &Path) -> Result<MemoryEntry> {
        let content = self
            .backend
            .read(path)
            .await
            .map_err(|e| AppError::Memory(format!("cannot read {}: {}", path.display(), e)))?;

        let metadata = match self.backend.read(&meta_path(path)).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt memory metadata");
                MemoryMetadata::default()
            }),
            Err(_) => MemoryMetadata::default(),
        };

        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(MemoryEntry {
            layer,
            key,
            content,
            metadata,
            path: path.to_path_buf(),
        })
    }

    /// All records of a layer sorted by key, plus how many were unreadable
    pub(crate) async fn load_layer(
        &self,
        session_id: &str,
        layer: MemoryLayer,
    ) -> Result<(Vec<MemoryEntry>, usize)> {
        let dir = self.layer_dir(session_id, layer);
        let files = self
            .backend
            .list(&dir)
            .await
            .map_err(|e| AppError::Memory(format!("cannot list {}: {}", dir.display(), e)))?;

        let mut entries = Vec::new();
        let mut skipped = 0;
        for file in files.iter().filter(|p| is_content_file(p)) {
            match self.load_entry(layer, file).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable memory record");
                    skipped += 1;
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok((entries, skipped))
    }

    /// All records of a layer sorted by key; unreadable records are skipped
    pub async fn entries(&self, session_id: &str, layer: MemoryLayer) -> Result<Vec<MemoryEntry>> {
        self.load_layer(session_id, layer).await.map(|(entries, _)| entries)
    }

    /// Browsing: list a layer's records without content
    pub async fn list_files(
        &self,
        session_id: &str,
        layer: MemoryLayer,
    ) -> Result<Vec<MemoryFileInfo>> {
        let entries = self.entries(session_id, layer).await?;
        Ok(entries
            .into_iter()
            .map(|e| MemoryFileInfo {
                layer: e.layer,
                size: e.content.len(),
                agent: e.metadata.agent,
                updated_at: e.metadata.updated_at,
                key: e.key,
                path: e.path,
            })
            .collect())
    }

    /// Browsing: fetch raw content by path.
    ///
    /// Relative paths are resolved against the workspace root; anything that
    /// escapes the root is refused.
    pub async fn read_path(&self, path: &Path) -> Result<String> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(AppError::InvalidInput(format!(
                "path '{}' escapes the memory workspace",
                path.display()
            )));
        }
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if !resolved.starts_with(&self.root) {
            return Err(AppError::InvalidInput(format!(
                "path '{}' is outside the memory workspace",
                path.display()
            )));
        }
        self.backend.read(&resolved).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                AppError::NotFound(format!("memory file {}", resolved.display()))
            }
            _ => AppError::Memory(format!("cannot read {}: {}", resolved.display(), e)),
        })
    }

    /// Budgeted retrieval with default options: every insight, every other
    /// agent's digest ranked by relevance, then matching raw references.
    pub async fn retrieve(
        &self,
        session_id: &str,
        requesting_agent: &str,
        query: &str,
        token_budget: usize,
    ) -> ContextBundle {
        let request = RetrievalRequest::new(session_id, requesting_agent, query, token_budget);
        self.retrieve_with(&request).await
    }

    /// Budgeted retrieval. Read failures degrade to a partial bundle.
    pub async fn retrieve_with(&self, request: &RetrievalRequest) -> ContextBundle {
        let load = |layer: MemoryLayer| {
            let session_id = request.session_id.clone();
            async move {
                match self.load_layer(&session_id, layer).await {
                    Ok((entries, skipped)) => (entries, skipped > 0),
                    Err(e) => {
                        warn!(
                            session_id = %session_id,
                            layer = %layer,
                            error = %e,
                            "memory read failed, continuing with partial context"
                        );
                        (Vec::new(), true)
                    }
                }
            }
        };

        let (insights, d1) = load(MemoryLayer::Insight).await;
        let (digests, d2) = load(MemoryLayer::Digest).await;
        let (raw, d3) = load(MemoryLayer::Raw).await;
        let mut bundle =
            retrieval::assemble(request, self.scorer.as_ref(), &insights, &digests, &raw);
        bundle.degraded = d1 || d2 || d3;
        bundle
    }
}

fn meta_path(content_path: &Path) -> PathBuf {
    let mut name = content_path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(META_SUFFIX);
    content_path.with_file_name(name)
}

fn is_content_file(path: &Path) -> bool {
    let is_md = path.extension().and_then(|e| e.to_str()) == Some(CONTENT_EXT);
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    is_md && !hidden
}

/// Keys become file stems: `[A-Za-z0-9_-]` only, `.md` suffix tolerated.
pub(crate) fn sanitize_key(key: &str) -> Result<String> {
    let key = key.trim();
    let key = key.strip_suffix(".md").unwrap_or(key);
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_KEY_LEN)
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_') {
        return Err(AppError::InvalidInput(format!(
            "memory key '{}' has no usable characters",
            key
        )));
    }
    Ok(sanitized)
}

pub(crate) fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).with_write_retries(0, Duration::from_millis(1));
        (dir, store)
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("key_findings.md").unwrap(), "key_findings");
        assert_eq!(sanitize_key("explorer/../x").unwrap(), "explorer____x");
        assert!(sanitize_key("   ").is_err());
        assert!(sanitize_key("///").is_err());
    }

    #[test]
    fn test_meta_path() {
        let p = meta_path(Path::new("/w/s/l1_digests/explorer.md"));
        assert_eq!(p, PathBuf::from("/w/s/l1_digests/explorer.meta.json"));
    }

    #[tokio::test]
    async fn test_write_and_read_round_trip_with_metadata() {
        let (_dir, store) = store();
        store.init_session("s1").await.unwrap();

        let path = store
            .write(
                "s1",
                MemoryLayer::Digest,
                "explorer",
                "# Digest",
                MemoryMetadata::for_agent("explorer").with_task("t1"),
            )
            .await
            .unwrap();
        assert!(path.ends_with("s1/l1_digests/explorer.md"));

        let entry = store
            .read("s1", MemoryLayer::Digest, "explorer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, "# Digest");
        assert_eq!(entry.metadata.agent.as_deref(), Some("explorer"));
        assert_eq!(entry.metadata.task_id.as_deref(), Some("t1"));
        assert_eq!(entry.metadata.content_sha256, content_hash("# Digest"));
        assert!(entry.metadata.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_raw_layer_is_write_once() {
        let (_dir, store) = store();
        store
            .write("s1", MemoryLayer::Raw, "explorer-1", "first", MemoryMetadata::default())
            .await
            .unwrap();
        let err = store
            .write("s1", MemoryLayer::Raw, "explorer-1", "second", MemoryMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Memory(_)));

        let entry = store.read("s1", MemoryLayer::Raw, "explorer-1").await.unwrap().unwrap();
        assert_eq!(entry.content, "first");
    }

    #[tokio::test]
    async fn test_mutable_layers_last_writer_wins() {
        let (_dir, store) = store();
        for content in ["v1", "v2", "v3"] {
            store
                .write("s1", MemoryLayer::Insight, "key_findings", content, MemoryMetadata::default())
                .await
                .unwrap();
        }
        let entry = store
            .read("s1", MemoryLayer::Insight, "key_findings")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, "v3");
    }

    #[tokio::test]
    async fn test_list_files_sorted_and_skips_sidecars() {
        let (_dir, store) = store();
        for agent in ["logician", "critic", "explorer"] {
            store
                .write("s1", MemoryLayer::Digest, agent, agent, MemoryMetadata::for_agent(agent))
                .await
                .unwrap();
        }
        let files = store.list_files("s1", MemoryLayer::Digest).await.unwrap();
        let keys: Vec<_> = files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["critic", "explorer", "logician"]);
        assert_eq!(files[0].agent.as_deref(), Some("critic"));
        assert!(store.list_files("other", MemoryLayer::Raw).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_path_refuses_escape() {
        let (_dir, store) = store();
        let path = store
            .write("s1", MemoryLayer::Insight, "open_questions", "why?", MemoryMetadata::default())
            .await
            .unwrap();

        assert_eq!(store.read_path(&path).await.unwrap(), "why?");
        assert_eq!(
            store
                .read_path(Path::new("s1/l2_insights/open_questions.md"))
                .await
                .unwrap(),
            "why?"
        );
        assert!(matches!(
            store.read_path(Path::new("../etc/passwd")).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            store.read_path(Path::new("/etc/passwd")).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            store.read_path(Path::new("s1/missing.md")).await,
            Err(AppError::NotFound(_))
        ));
    }
}
