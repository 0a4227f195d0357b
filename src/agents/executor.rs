//! Agent executor: runs one research task through the prompt, memory and
//! preprocessing stages, calls the model and persists the raw output.

use super::preprocess::preprocess;
use super::profile::AgentProfile;
use super::prompt::{build_system_prompt, build_task_prompt, refine_prompt};
use super::structured;
use crate::llm::{CompletionRequest, LLMClient};
use crate::memory::{MemoryLayer, MemoryMetadata, MemoryStore};
use crate::types::{AgentExecution, AppError, ExecutionStatus, ResearchTask, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Output ceiling for a profile test call
const TEST_MAX_TOKENS: u32 = 1000;

/// Pipeline stage reported through progress callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Prompt,
    Memory,
    Preprocess,
    Model,
    Persist,
}

impl ExecutionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStage::Prompt => "prompt",
            ExecutionStage::Memory => "memory",
            ExecutionStage::Preprocess => "preprocess",
            ExecutionStage::Model => "model",
            ExecutionStage::Persist => "persist",
        }
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ProgressFn = Arc<dyn Fn(ExecutionStage) + Send + Sync>;

/// Per-attempt inputs that are not part of the task or profile
#[derive(Clone)]
pub struct ExecutionContext {
    /// The session's research question
    pub session_task: String,
    /// Model for this attempt (primary or fallback)
    pub model: String,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl ExecutionContext {
    pub fn new(session_task: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            session_task: session_task.into(),
            model: model.into(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, stage: ExecutionStage) {
        if let Some(progress) = &self.progress {
            progress(stage);
        }
    }

    /// Race `fut` against cancellation
    async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled("execution cancelled".to_string())),
            value = fut => Ok(value),
        }
    }
}

/// Result of a one-off profile test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTestResult {
    pub agent_type: String,
    pub task: String,
    pub result: String,
    pub tokens_used: u64,
    pub model_used: String,
}

/// Runs agent profiles against research tasks
pub struct AgentExecutor {
    llm: Arc<dyn LLMClient>,
    memory: Arc<MemoryStore>,
}

impl AgentExecutor {
    pub fn new(llm: Arc<dyn LLMClient>, memory: Arc<MemoryStore>) -> Self {
        Self { llm, memory }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Run one attempt, filling in `execution`.
    ///
    /// On success the record is `completed`. On error the record is left
    /// `running` for the caller to close with [`AgentExecution::fail`], since
    /// a timed-out attempt never reaches this function's end.
    #[instrument(
        skip(self, execution, task, profile, ctx),
        fields(task_id = %task.id, agent = %profile.agent_type, model = %ctx.model)
    )]
    pub async fn execute(
        &self,
        execution: &mut AgentExecution,
        task: &ResearchTask,
        profile: &AgentProfile,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let started = Instant::now();
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.model_used = Some(ctx.model.clone());
        execution.profile_id = Some(profile.id.clone());
        let mut tokens_used = 0u64;

        // Prompt
        ctx.report(ExecutionStage::Prompt);
        let system = build_system_prompt(profile);
        let task_prompt = build_task_prompt(&task.description, &ctx.session_task);
        let refined = ctx
            .guard(refine_prompt(self.llm.as_ref(), profile, &task_prompt))
            .await?;
        tokens_used += refined.tokens_used;

        // Memory
        ctx.report(ExecutionStage::Memory);
        let request = profile.retrieval_request(&task.session_id, &task.description);
        let bundle = ctx.guard(self.memory.retrieve_with(&request)).await?;
        let summary = bundle.summary();
        execution.input_context = Some(summary.clone());
        debug!(
            tokens = bundle.tokens_used,
            budget = bundle.token_budget,
            degraded = bundle.degraded,
            "context retrieved"
        );

        // Preprocess
        ctx.report(ExecutionStage::Preprocess);
        let cleaned = preprocess(&bundle.render(), &task.description, &profile.pipeline.preprocessing);

        // Model
        ctx.report(ExecutionStage::Model);
        let prompt = if cleaned.text.trim().is_empty() {
            refined.prompt.clone()
        } else {
            format!("{}\n\n## Context\n{}\n", refined.prompt, cleaned.text)
        };
        let request = CompletionRequest::new(ctx.model.clone(), prompt)
            .with_system(system)
            .with_temperature(profile.temperature)
            .with_max_tokens(profile.max_tokens);
        let completion = ctx.guard(self.llm.complete(&request)).await??;
        tokens_used += completion.tokens_used;

        // Persist
        ctx.report(ExecutionStage::Persist);
        let key = format!("{}-{}", profile.agent_type, execution.id);
        let mut raw = format!(
            "# Raw output: {agent}\n\n## Task\n{task}\n\n## Prompt\n{prompt}\n\n## Context\n{summary}\n## Output\n",
            agent = profile.agent_type,
            task = task.description,
            prompt = refined.prompt,
            summary = summary,
        );
        let output_offset = raw.len();
        raw.push_str(&completion.content);
        raw.push('\n');
        let metadata = MemoryMetadata::for_agent(&profile.agent_type)
            .with_task(&task.id)
            .with_tag(ctx.model.clone())
            .with_output_offset(output_offset);
        execution.raw_path = Some(self.memory.path_for(&task.session_id, MemoryLayer::Raw, &key)?);
        let path = ctx
            .guard(self.memory.write(
                &task.session_id,
                MemoryLayer::Raw,
                &key,
                &raw,
                metadata,
            ))
            .await??;

        let structured = structured::extract(&completion.content);
        execution.confidence = structured.confidence();
        execution.structured_output = structured;
        execution.output = Some(completion.content);
        execution.raw_path = Some(path);
        execution.tokens_used = tokens_used;
        execution.duration_ms = started.elapsed().as_millis() as u64;
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(Utc::now());

        info!(
            tokens = tokens_used,
            duration_ms = execution.duration_ms,
            confidence = execution.confidence,
            "agent execution completed"
        );
        Ok(())
    }

    /// One model call with only the persona as system prompt
    #[instrument(skip(self, profile), fields(agent = %profile.agent_type))]
    pub async fn test_profile(&self, profile: &AgentProfile, task: &str) -> Result<AgentTestResult> {
        if task.trim().is_empty() {
            return Err(AppError::InvalidInput("test task must not be empty".to_string()));
        }
        let system = if profile.persona.trim().is_empty() {
            "You are a helpful assistant.".to_string()
        } else {
            profile.persona.clone()
        };
        let request = CompletionRequest::new(profile.role_model.clone(), task)
            .with_system(system)
            .with_temperature(profile.temperature)
            .with_max_tokens(profile.max_tokens.min(TEST_MAX_TOKENS));
        let completion = self.llm.complete(&request).await?;

        Ok(AgentTestResult {
            agent_type: profile.agent_type.clone(),
            task: task.to_string(),
            result: completion.content,
            tokens_used: completion.tokens_used,
            model_used: profile.role_model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::profile::{Cluster, NewProfile};
    use crate::llm::Completion;
    use crate::memory::{FsBackend, MemoryBackend};
    use crate::types::{Priority, TaskStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<CompletionRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl LLMClient for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(AppError::LLM("provider down".into()));
            }
            Ok(Completion::estimated(
                request,
                "## Key Findings\n- SSMs scale linearly\n- Attention is quadratic\n\
                 ## Uncertainties\n- Long-range recall\n"
                    .to_string(),
            ))
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn task(session_id: &str) -> ResearchTask {
        let now = Utc::now();
        ResearchTask {
            id: "t1".into(),
            session_id: session_id.into(),
            parent_id: None,
            description: "Compare Transformer and SSM scaling".into(),
            assigned_agent: "explorer".into(),
            priority: Priority::High,
            status: TaskStatus::InProgress,
            dependencies: vec![],
            execution_order: 0,
            execution_group: 0,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn profile() -> AgentProfile {
        let mut input = NewProfile::new("explorer", "Explorer", Cluster::Information, "openai/gpt-4o");
        input.persona = "You are an explorer.".into();
        input.max_tokens = 4000;
        input.into_profile("u", false).unwrap()
    }

    #[tokio::test]
    async fn test_execute_persists_raw_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        memory.init_session("s1").await.unwrap();
        let llm = Arc::new(Recorder::default());
        let executor = AgentExecutor::new(llm.clone(), memory.clone());

        let stages = Arc::new(Mutex::new(Vec::<ExecutionStage>::new()));
        let sink = stages.clone();
        let ctx = ExecutionContext::new("Transformers vs SSMs", "openai/gpt-4o")
            .with_progress(Arc::new(move |stage: ExecutionStage| sink.lock().push(stage)));

        let task = task("s1");
        let mut execution = AgentExecution::pending(&task, None, "Explorer");
        executor
            .execute(&mut execution, &task, &profile(), &ctx)
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.structured_output.key_findings.len(), 2);
        assert_eq!(execution.structured_output.uncertainties.len(), 1);
        assert!((execution.confidence - 0.45).abs() < 1e-6);
        assert!(execution.tokens_used > 0);
        assert_eq!(execution.model_used.as_deref(), Some("openai/gpt-4o"));

        let key = format!("explorer-{}", execution.id);
        let raw = memory.read("s1", MemoryLayer::Raw, &key).await.unwrap().unwrap();
        assert!(raw.content.contains("## Output\n## Key Findings"));
        assert_eq!(raw.metadata.task_id.as_deref(), Some("t1"));
        let offset = raw.metadata.output_offset.unwrap();
        assert_eq!(&raw.content[offset..], format!("{}\n", execution.output.as_deref().unwrap()));
        assert_eq!(execution.raw_path.as_deref(), Some(raw.path.as_path()));

        assert_eq!(
            *stages.lock(),
            vec![
                ExecutionStage::Prompt,
                ExecutionStage::Memory,
                ExecutionStage::Preprocess,
                ExecutionStage::Model,
                ExecutionStage::Persist
            ]
        );

        let requests = llm.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system.as_deref().map(|s| s.starts_with("You are an explorer.")), Some(true));
        assert!(requests[0].prompt.contains("## Research Goal\nTransformers vs SSMs"));
    }

    #[tokio::test]
    async fn test_model_failure_leaves_record_for_caller() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let llm = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let executor = AgentExecutor::new(llm, memory.clone());
        let ctx = ExecutionContext::new("q", "openai/gpt-4o");

        let task = task("s1");
        let mut execution = AgentExecution::pending(&task, None, "Explorer");
        let err = executor
            .execute(&mut execution, &task, &profile(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LLM(_)));

        execution.fail(&err);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_message.as_deref(), Some("LLM error: provider down"));
        assert!(memory.entries("s1", MemoryLayer::Raw).await.unwrap().is_empty());
    }

    /// Raw content lands, then the sidecar write never finishes
    struct StallingRawSidecar;

    #[async_trait]
    impl MemoryBackend for StallingRawSidecar {
        async fn write(&self, path: &Path, content: &str) -> io::Result<()> {
            let in_raw = path
                .parent()
                .map(|dir| dir.ends_with(MemoryLayer::Raw.dir_name()))
                .unwrap_or(false);
            if in_raw && path.to_string_lossy().ends_with(".meta.json") {
                std::future::pending::<()>().await;
            }
            FsBackend.write(path, content).await
        }

        async fn read(&self, path: &Path) -> io::Result<String> {
            FsBackend.read(path).await
        }

        async fn exists(&self, path: &Path) -> io::Result<bool> {
            FsBackend.exists(path).await
        }

        async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            FsBackend.list(dir).await
        }

        async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
            FsBackend.create_dir_all(dir).await
        }
    }

    #[tokio::test]
    async fn test_timeout_during_raw_write_keeps_raw_path() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()).with_backend(Arc::new(StallingRawSidecar)));
        memory.init_session("s1").await.unwrap();
        let executor = AgentExecutor::new(Arc::new(Recorder::default()), memory.clone());
        let ctx = ExecutionContext::new("q", "openai/gpt-4o");

        let task = task("s1");
        let mut execution = AgentExecution::pending(&task, None, "Explorer");
        let prof = profile();
        let attempt = executor.execute(&mut execution, &task, &prof, &ctx);
        assert!(tokio::time::timeout(Duration::from_millis(200), attempt).await.is_err());

        let expected = memory
            .path_for("s1", MemoryLayer::Raw, &format!("explorer-{}", execution.id))
            .unwrap();
        assert_eq!(execution.raw_path.as_deref(), Some(expected.as_path()));
        assert!(expected.is_file());
        assert_ne!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let llm = Arc::new(Recorder::default());
        let executor = AgentExecutor::new(llm.clone(), memory);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ExecutionContext::new("q", "openai/gpt-4o").with_cancel(cancel);

        let task = task("s1");
        let mut execution = AgentExecution::pending(&task, None, "Explorer");
        let err = executor
            .execute(&mut execution, &task, &profile(), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(llm.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_profile_test_call() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(Recorder::default());
        let executor = AgentExecutor::new(llm.clone(), Arc::new(MemoryStore::new(dir.path())));

        let result = executor.test_profile(&profile(), "Say hi").await.unwrap();
        assert_eq!(result.agent_type, "explorer");
        assert_eq!(result.model_used, "openai/gpt-4o");

        let requests = llm.requests.lock();
        assert_eq!(requests[0].max_tokens, 1000);
        assert_eq!(requests[0].system.as_deref(), Some("You are an explorer."));
        assert_eq!(requests[0].prompt, "Say hi");
    }
}
