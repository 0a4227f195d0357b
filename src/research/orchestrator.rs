//! Orchestrator: drives a session from decomposition through grouped,
//! bounded-concurrency execution to synthesis.
//!
//! Groups run in ascending order with a barrier between them. Inside a
//! group, tasks are dispatched in `execution_order` onto a [`JoinSet`],
//! bounded by a [`Semaphore`]. A task failure never crosses the barrier;
//! only decomposition errors, an unreachable memory workspace, cancellation
//! and internal faults end a session as `failed`.

use super::archivist::Archivist;
use super::contradiction::ContradictionDetector;
use super::decomposer::{LlmDecomposer, TaskDecomposer, TaskGraph, TaskGraphBuilder};
use super::events::{EventKind, EventSink, ResearchEvent};
use super::graph::{execution_groups, verify_layering};
use super::session::{fail_session, task_progress, SessionAggregate, SessionState, Usage, UsageRecorder};
use crate::agents::{AgentExecutor, AgentProfile, ExecutionContext, ProfileSet, ProgressFn};
use crate::db::ResearchRepository;
use crate::llm::{CompletionRequest, LLMClient};
use crate::memory::{MemoryEntry, MemoryLayer, MemoryStore, CONTRADICTIONS, KEY_FINDINGS, OPEN_QUESTIONS};
use crate::types::{
    AgentExecution, AppError, FailureReason, ResearchSession, ResearchTask, Result, SessionStatus,
    TaskStatus,
};
use crate::utils::toml_config::{ArchivistConfig, NexenConfig, RuntimeConfig};
use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound for `ExecuteOptions::max_agents`
pub const MAX_AGENTS: usize = 14;
const SYNTHESIS_MAX_TOKENS: u32 = 4000;
const SYNTHESIZER_PERSONA: &str = "You are a research synthesizer. You merge the findings of \
    several specialist agents into one coherent, well-structured report, keep claims tied to \
    the evidence provided and call out disagreements explicitly.";

/// Per-run execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Concurrent agents for this run, 1..=14
    pub max_agents: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { max_agents: 5 }
    }
}

impl ExecuteOptions {
    pub fn with_max_agents(max_agents: usize) -> Result<Self> {
        let options = Self { max_agents };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_AGENTS).contains(&self.max_agents) {
            return Err(AppError::InvalidInput(format!(
                "max_agents must be between 1 and {}, got {}",
                MAX_AGENTS, self.max_agents
            )));
        }
        Ok(())
    }
}

/// Handle for a live execution: the ordered event stream, cancellation
/// and the final session state
pub struct ResearchRun {
    session_id: String,
    events: Pin<Box<dyn Stream<Item = ResearchEvent> + Send>>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<ResearchSession>>,
}

impl ResearchRun {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request cancellation; in-flight tasks get the configured grace period
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Final session state; does not drain the event stream
    pub async fn join(self) -> Result<ResearchSession> {
        self.handle
            .await
            .map_err(|e| AppError::Internal(format!("research run aborted: {}", e)))?
    }

    /// Drain every event, then wait for the final state
    pub async fn collect(mut self) -> (Vec<ResearchEvent>, Result<ResearchSession>) {
        use futures::StreamExt;
        let mut events = Vec::new();
        while let Some(event) = self.events.next().await {
            events.push(event);
        }
        (events, self.join().await)
    }
}

impl Stream for ResearchRun {
    type Item = ResearchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

/// Removes a session from the in-flight set when dropped
struct ActiveClaim {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.session_id);
    }
}

/// Report produced by the synthesis pseudo-execution
#[derive(Debug, Clone)]
struct Synthesis {
    report: String,
    tokens_used: u64,
    model: String,
    fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupTally {
    completed: usize,
    failed: usize,
    skipped: usize,
}

impl GroupTally {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed => self.failed += 1,
        }
    }
}

struct Progress {
    terminal: usize,
    total: usize,
}

/// Shared state of one run, handed to every spawned task
struct RunContext {
    session_id: String,
    session_task: String,
    repo: Arc<dyn ResearchRepository>,
    executor: Arc<AgentExecutor>,
    archivist: Arc<Archivist>,
    profiles: Arc<ProfileSet>,
    sink: EventSink,
    usage: UsageRecorder,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
    runtime: RuntimeConfig,
    costs: Arc<HashMap<String, u64>>,
}

impl RunContext {
    fn cost(&self, model: &str, tokens: u64) -> u64 {
        tokens * self.costs.get(model).copied().unwrap_or(0) / 1000
    }

    fn progress_value(&self) -> u8 {
        let p = self.progress.lock();
        task_progress(p.terminal, p.total)
    }

    /// Count a task as terminal and emit its event with the new progress,
    /// under one lock so progress never goes backwards in the stream
    fn finish_task(&self, event: impl FnOnce(u8) -> EventKind) -> u8 {
        let mut p = self.progress.lock();
        p.terminal += 1;
        let value = task_progress(p.terminal, p.total);
        self.sink.emit(event(value));
        value
    }

    async fn save_task(&self, task: &ResearchTask) {
        if let Err(e) = self.repo.update_task(task).await {
            error!(session_id = %self.session_id, task_id = %task.id, error = %e, "failed to persist task");
        }
    }

    async fn save_execution(&self, execution: &AgentExecution) {
        if let Err(e) = self.repo.upsert_execution(execution).await {
            error!(
                session_id = %self.session_id,
                task_id = %execution.task_id,
                error = %e,
                "failed to persist execution"
            );
        }
    }

    /// Cancelled before dispatch
    async fn skip(&self, mut task: ResearchTask) {
        task.status = TaskStatus::Skipped;
        task.updated_at = Utc::now();
        self.save_task(&task).await;
        self.progress.lock().terminal += 1;
        debug!(session_id = %self.session_id, task_id = %task.id, "task skipped");
    }

    /// A task whose future was aborted or panicked: close its records
    async fn abandon(&self, mut task: ResearchTask, cause: AppError) {
        task.status = TaskStatus::Failed;
        task.updated_at = Utc::now();
        self.save_task(&task).await;
        match self.repo.list_executions(&self.session_id, Some(&task.id)).await {
            Ok(records) => {
                for mut record in records.into_iter().filter(|r| !r.status.is_terminal()) {
                    record.fail(&cause);
                    self.save_execution(&record).await;
                }
            }
            Err(e) => error!(task_id = %task.id, error = %e, "cannot close abandoned executions"),
        }
        warn!(session_id = %self.session_id, task_id = %task.id, error = %cause, "task abandoned");
        self.finish_task(|progress| EventKind::TaskFailed {
            task_id: task.id.clone(),
            agent: task.assigned_agent.clone(),
            error: cause.to_string(),
            retry_count: 0,
            progress,
        });
    }

    /// One attempt under the task timeout, reporting stages as events
    async fn attempt(
        &self,
        execution: &mut AgentExecution,
        task: &ResearchTask,
        profile: &AgentProfile,
        model: &str,
    ) -> Result<()> {
        let cancel = self.cancel.child_token();
        let sink = self.sink.clone();
        let (task_id, agent) = (task.id.clone(), profile.agent_type.clone());
        let progress: ProgressFn = Arc::new(move |stage| {
            sink.emit(EventKind::TaskProgress {
                task_id: task_id.clone(),
                agent: agent.clone(),
                stage,
            });
        });
        let ctx = ExecutionContext::new(self.session_task.clone(), model)
            .with_cancel(cancel.clone())
            .with_progress(progress);

        let limit = self.runtime.task_timeout();
        match tokio::time::timeout(limit, self.executor.execute(execution, task, profile, &ctx)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(AppError::Timeout {
                    task_id: task.id.clone(),
                    agent: profile.agent_type.clone(),
                    after_secs: limit.as_secs(),
                })
            }
        }
    }

    /// Incremental archivist pass for a completed execution's raw record,
    /// merging the output the executor already extracted
    async fn archive(&self, execution: &AgentExecution) {
        if execution.raw_path.is_none() {
            return;
        }
        let agent = execution.agent_type.as_str();
        let merge = self
            .archivist
            .merge_into_digest(&self.session_id, agent, &execution.structured_output);
        match cancellable(&self.cancel, merge).await {
            Ok(Ok(update)) => debug!(agent, added = update.added, "digest merged"),
            Ok(Err(e)) => warn!(session_id = %self.session_id, agent, error = %e, "incremental archivist pass failed"),
            Err(_) => debug!(agent, "incremental archivist pass cancelled"),
        }
    }
}

/// Run one task to a terminal state: primary model first, then the
/// fallback model while the retry budget lasts
async fn run_task(ctx: Arc<RunContext>, mut task: ResearchTask, permit: OwnedSemaphorePermit) -> TaskOutcome {
    let _permit = permit;
    let Some(profile) = ctx.profiles.get(&task.assigned_agent).cloned() else {
        let cause = AppError::missing_agent(task.assigned_agent.clone());
        ctx.abandon(task, cause).await;
        return TaskOutcome::Failed;
    };

    task.status = TaskStatus::InProgress;
    task.updated_at = Utc::now();
    ctx.save_task(&task).await;

    let fallback = profile
        .fallback_model
        .clone()
        .filter(|m| !m.trim().is_empty());
    let retries = if fallback.is_some() { ctx.runtime.retry_budget } else { 0 };
    let max_attempts = 1 + retries;
    let mut last_error: Option<(AppError, u32)> = None;

    for attempt in 1..=max_attempts {
        let model = match (&fallback, attempt) {
            (Some(fallback), n) if n > 1 => fallback.clone(),
            _ => profile.role_model.clone(),
        };
        ctx.sink.emit(EventKind::TaskStarted {
            task_id: task.id.clone(),
            agent: profile.agent_type.clone(),
            group: task.execution_group,
            attempt,
            model: model.clone(),
        });

        let mut execution = AgentExecution::pending(&task, Some(profile.id.clone()), &profile.display_name);
        execution.retry_count = attempt - 1;
        ctx.save_execution(&execution).await;

        match ctx.attempt(&mut execution, &task, &profile, &model).await {
            Ok(()) => {
                ctx.usage.record(Usage {
                    tokens: execution.tokens_used,
                    cost_micros: ctx.cost(&model, execution.tokens_used),
                });
                ctx.save_execution(&execution).await;
                task.status = TaskStatus::Completed;
                task.output = execution.output.clone();
                task.updated_at = Utc::now();
                ctx.save_task(&task).await;
                ctx.archive(&execution).await;
                ctx.finish_task(|progress| EventKind::TaskCompleted {
                    task_id: task.id.clone(),
                    agent: profile.agent_type.clone(),
                    tokens_used: execution.tokens_used,
                    duration_ms: execution.duration_ms,
                    confidence: execution.confidence,
                    progress,
                });
                return TaskOutcome::Completed;
            }
            Err(e) => {
                execution.fail(&e);
                ctx.save_execution(&execution).await;
                let cancelled = e.is_cancellation() || ctx.cancel.is_cancelled();
                if !cancelled && e.is_retryable() && attempt < max_attempts {
                    warn!(
                        session_id = %ctx.session_id,
                        task_id = %task.id,
                        agent = %profile.agent_type,
                        attempt,
                        error = %e,
                        "attempt failed, retrying on fallback model"
                    );
                    continue;
                }
                last_error = Some((e, attempt - 1));
                break;
            }
        }
    }

    let (error, retry_count) = last_error
        .unwrap_or_else(|| (AppError::Internal("task ended without an attempt".to_string()), 0));
    task.status = TaskStatus::Failed;
    task.updated_at = Utc::now();
    ctx.save_task(&task).await;
    warn!(
        session_id = %ctx.session_id,
        task_id = %task.id,
        agent = %profile.agent_type,
        retry_count,
        error = %error,
        "task failed"
    );
    ctx.finish_task(|progress| EventKind::TaskFailed {
        task_id: task.id.clone(),
        agent: profile.agent_type.clone(),
        error: error.to_string(),
        retry_count,
        progress,
    });
    TaskOutcome::Failed
}

/// Race `fut` against cancellation
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled("research cancelled".to_string())),
        value = fut => Ok(value),
    }
}

fn advance(session: &mut ResearchSession, state: &mut SessionState, next: SessionState) -> Result<()> {
    state.apply(session, next)?;
    *state = next;
    Ok(())
}

fn archived(session_id: &str) -> AppError {
    AppError::Conflict(format!("session {} is archived", session_id))
}

fn truncate_chars(text: &str, max: usize) -> String {
    let mut out: String = text.chars().take(max).collect();
    if text.chars().nth(max).is_some() {
        out.push_str("...");
    }
    out
}

/// Insight content without its title line
fn insight_body<'a>(insights: &'a [MemoryEntry], key: &str) -> Option<&'a str> {
    let entry = insights.iter().find(|e| e.key == key)?;
    let body = entry
        .content
        .split_once('\n')
        .map(|(first, rest)| if first.starts_with("# ") { rest } else { entry.content.as_str() })
        .unwrap_or("");
    let body = body.trim();
    (!body.is_empty()).then_some(body)
}

/// The synthesis input: the research question and the L2 insights, nothing else
fn synthesis_prompt(session: &ResearchSession, insights: &[MemoryEntry]) -> String {
    let mut out = format!("## Research Task\n{}\n\n## Research Insights\n", session.task.trim());
    if insights.is_empty() {
        out.push_str("(none)\n");
    }
    for entry in insights {
        let _ = writeln!(out, "{}\n", entry.content.trim());
    }
    out.push_str(
        "\nWrite the final research report in markdown with exactly these sections: \
         `## Overview`, `## Key Findings`, `## Key Insights`, `## Conclusions & Recommendations`.\n",
    );
    out
}

/// Whether an insight body carries any bulleted items
fn has_items(body: Option<&str>) -> bool {
    body.map(|b| b.lines().any(|l| l.trim_start().starts_with("- ")))
        .unwrap_or(false)
}

/// Report assembled without a model, from the insights alone
fn fallback_report(session: &ResearchSession, insights: &[MemoryEntry]) -> String {
    let mut out = format!(
        "# Research Report: {}\n\n## Overview\n{}\n\nCompiled from {} insight record(s).\n\n## Key Findings\n",
        session.name,
        session.task.trim(),
        insights.len()
    );
    let findings = insight_body(insights, KEY_FINDINGS);
    out.push_str(findings.unwrap_or("No findings were recorded."));
    out.push_str("\n\n## Key Insights\n");
    let questions = insight_body(insights, OPEN_QUESTIONS);
    let contradictions = insight_body(insights, CONTRADICTIONS);
    let mut any = false;
    for body in [questions, contradictions].into_iter().flatten() {
        let _ = writeln!(out, "{}\n", body);
        any = true;
    }
    if !any {
        out.push_str("No further insights were recorded.\n\n");
    }

    out.push_str("## Conclusions & Recommendations\n");
    let strongest = findings.and_then(|b| b.lines().find_map(|l| l.trim().strip_prefix("1. ")));
    match strongest {
        Some(finding) => {
            let _ = writeln!(out, "- Strongest finding: {}", finding);
        }
        None => out.push_str("- No agent findings were recorded; re-run the session.\n"),
    }
    if has_items(questions) {
        out.push_str("- Resolve the open questions before acting on these findings.\n");
    }
    if has_items(contradictions) {
        out.push_str("- Reconcile the flagged contradictions.\n");
    }
    out
}

/// Drives research sessions end to end
#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn ResearchRepository>,
    memory: Arc<MemoryStore>,
    llm: Arc<dyn LLMClient>,
    executor: Arc<AgentExecutor>,
    archivist: Arc<Archivist>,
    archivist_config: ArchivistConfig,
    graph: Arc<TaskGraphBuilder>,
    runtime: RuntimeConfig,
    decomposer_model: String,
    costs: Arc<HashMap<String, u64>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(
        config: &NexenConfig,
        llm: Arc<dyn LLMClient>,
        repo: Arc<dyn ResearchRepository>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        let decomposer: Arc<dyn TaskDecomposer> =
            Arc::new(LlmDecomposer::new(Arc::clone(&llm), config.decomposer.clone()));
        Self {
            executor: Arc::new(AgentExecutor::new(Arc::clone(&llm), Arc::clone(&memory))),
            archivist: Arc::new(Archivist::new(Arc::clone(&memory), config.archivist.clone())),
            archivist_config: config.archivist.clone(),
            graph: Arc::new(TaskGraphBuilder::new(decomposer)),
            runtime: config.runtime.clone(),
            decomposer_model: config.decomposer.model.clone(),
            costs: Arc::new(config.cost_table()),
            active: Arc::new(Mutex::new(HashSet::new())),
            repo,
            memory,
            llm,
        }
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn TaskDecomposer>) -> Self {
        self.graph = Arc::new(TaskGraphBuilder::new(decomposer));
        self
    }

    pub fn with_contradiction_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.archivist = Arc::new(
            Archivist::new(Arc::clone(&self.memory), self.archivist_config.clone()).with_detector(detector),
        );
        self
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn repository(&self) -> &Arc<dyn ResearchRepository> {
        &self.repo
    }

    pub fn executor(&self) -> &Arc<AgentExecutor> {
        &self.executor
    }

    /// Create and store a new session
    pub async fn create_session(&self, owner_id: &str, name: &str, task: &str) -> Result<ResearchSession> {
        if task.trim().is_empty() {
            return Err(AppError::InvalidInput("research task must not be empty".to_string()));
        }
        let name = if name.trim().is_empty() {
            truncate_chars(task.trim(), 60)
        } else {
            name.trim().to_string()
        };
        let session = ResearchSession::new(owner_id, name, task.trim(), self.memory.root());
        self.repo.create_session(&session).await?;
        info!(session_id = %session.id, owner = owner_id, "research session created");
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> Result<ResearchSession> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))
    }

    pub async fn tasks(&self, session_id: &str) -> Result<Vec<ResearchTask>> {
        self.repo.list_tasks(session_id).await
    }

    pub async fn executions(&self, session_id: &str, task_id: Option<&str>) -> Result<Vec<AgentExecution>> {
        self.repo.list_executions(session_id, task_id).await
    }

    fn claim(&self, session_id: &str) -> Result<ActiveClaim> {
        if !self.active.lock().insert(session_id.to_string()) {
            return Err(AppError::Conflict(format!(
                "session {} is already being processed",
                session_id
            )));
        }
        Ok(ActiveClaim {
            active: Arc::clone(&self.active),
            session_id: session_id.to_string(),
        })
    }

    /// Build (or rebuild) a session's task graph without executing it.
    ///
    /// Rejected once the session is executing or later. A decomposition
    /// error fails the session.
    #[instrument(skip(self, profiles))]
    pub async fn decompose(&self, session_id: &str, profiles: &ProfileSet) -> Result<TaskGraph> {
        let _claim = self.claim(session_id)?;
        let mut session = self.session(session_id).await?;
        let state = SessionState::of(&session).ok_or_else(|| archived(session_id))?;
        if !state.allows_decomposition() {
            return Err(AppError::Conflict(format!(
                "session {} is {}; re-decomposition is only possible before execution",
                session_id, state
            )));
        }
        match self.plan(&mut session, profiles).await {
            Ok(graph) => Ok(graph),
            Err(e) => {
                error!(session_id, error = %e, "decomposition failed");
                fail_session(&mut session, FailureReason::Error, e.to_string());
                if let Err(pe) = self.repo.update_session(&session).await {
                    error!(session_id, error = %pe, "failed to persist session failure");
                }
                Err(e)
            }
        }
    }

    async fn plan(&self, session: &mut ResearchSession, profiles: &ProfileSet) -> Result<TaskGraph> {
        let mut state = SessionState::of(session).ok_or_else(|| archived(&session.id))?;
        if !state.allows_decomposition() {
            return Err(AppError::Conflict(format!(
                "session {} is {}; re-decomposition is only possible before execution",
                session.id, state
            )));
        }
        advance(session, &mut state, SessionState::Decomposing)?;
        self.repo.update_session(session).await?;

        let graph = self.graph.build(&session.id, &session.task, profiles).await?;
        self.repo.replace_tasks(&session.id, &graph.tasks).await?;

        session.tokens_used += graph.tokens_used;
        session.cost_micros +=
            graph.tokens_used * self.costs.get(&self.decomposer_model).copied().unwrap_or(0) / 1000;
        session.progress = 5;
        advance(session, &mut state, SessionState::Planned)?;
        self.repo.update_session(session).await?;
        info!(
            session_id = %session.id,
            tasks = graph.tasks.len(),
            groups = graph.group_count(),
            fallback = graph.fallback,
            "decomposition complete"
        );
        Ok(graph)
    }

    /// Start executing a session in the background.
    ///
    /// The session must be `created` (it is decomposed first) or `planned`.
    /// `profiles` is the snapshot every task of this run uses.
    #[instrument(skip(self, profiles), fields(max_agents = options.max_agents))]
    pub async fn execute(
        &self,
        session_id: &str,
        profiles: ProfileSet,
        options: ExecuteOptions,
    ) -> Result<ResearchRun> {
        options.validate()?;
        let claim = self.claim(session_id)?;
        let session = self.session(session_id).await?;
        let state = SessionState::of(&session).ok_or_else(|| archived(session_id))?;
        if !state.allows_decomposition() {
            return Err(AppError::Conflict(format!(
                "session {} is already {}",
                session_id, state
            )));
        }

        let cancel = CancellationToken::new();
        let (sink, mut rx) = EventSink::channel(session_id);
        let this = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _claim = claim;
            this.run(session, Arc::new(profiles), options, sink, token).await
        });
        let events = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };

        Ok(ResearchRun {
            session_id: session_id.to_string(),
            events: Box::pin(events),
            cancel,
            handle,
        })
    }

    /// Execute and collect every event
    pub async fn run_to_completion(
        &self,
        session_id: &str,
        profiles: ProfileSet,
        options: ExecuteOptions,
    ) -> Result<(ResearchSession, Vec<ResearchEvent>)> {
        let run = self.execute(session_id, profiles, options).await?;
        let (events, session) = run.collect().await;
        Ok((session?, events))
    }

    async fn run(
        self,
        mut session: ResearchSession,
        profiles: Arc<ProfileSet>,
        options: ExecuteOptions,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<ResearchSession> {
        sink.emit(EventKind::SessionStarted {
            task: session.task.clone(),
            max_agents: options.max_agents,
        });
        let concurrency = options.max_agents.min(self.runtime.max_concurrency).max(1);
        info!(session_id = %session.id, concurrency, agents = profiles.len(), "research run started");

        let outcome = self.drive(&mut session, &profiles, concurrency, &sink, &cancel).await;
        let Err(e) = outcome else {
            return Ok(session);
        };

        let reason = if e.is_cancellation() {
            FailureReason::Cancelled
        } else {
            FailureReason::Error
        };
        match reason {
            FailureReason::Cancelled => info!(session_id = %session.id, "research run cancelled"),
            FailureReason::Error => error!(session_id = %session.id, error = %e, "research run failed"),
        }
        fail_session(&mut session, reason, e.to_string());
        let (task_id, agent) = match e.task_context() {
            Some((t, a)) => (Some(t.to_string()), Some(a.to_string())),
            None => (None, None),
        };
        let agent = agent.or_else(|| match &e {
            AppError::Decomposition { agent, .. } => agent.clone(),
            _ => None,
        });
        sink.emit(EventKind::Error {
            message: e.to_string(),
            task_id,
            agent,
        });
        if let Err(pe) = self.repo.update_session(&session).await {
            error!(session_id = %session.id, error = %pe, "failed to persist session failure");
        }
        sink.emit(EventKind::SessionCompleted {
            status: SessionStatus::Failed,
            progress: session.progress,
            tokens_used: session.tokens_used,
            cost_micros: session.cost_micros,
        });

        match e {
            AppError::Decomposition { .. } | AppError::Cancelled(_) | AppError::Memory(_) => Ok(session),
            other => Err(other),
        }
    }

    async fn drive(
        &self,
        session: &mut ResearchSession,
        profiles: &Arc<ProfileSet>,
        concurrency: usize,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.memory.init_session(&session.id).await?;

        let mut state = SessionState::of(session).ok_or_else(|| archived(&session.id))?;
        let (tasks, fallback) = if state == SessionState::Created {
            let graph = cancellable(cancel, self.plan(session, profiles)).await??;
            (graph.tasks, graph.fallback)
        } else {
            let tasks = self.repo.list_tasks(&session.id).await?;
            if tasks.is_empty() {
                return Err(AppError::decomposition("session has no tasks"));
            }
            verify_layering(&tasks)?;
            if let Some(task) = tasks.iter().find(|t| !profiles.contains(&t.assigned_agent)) {
                return Err(AppError::missing_agent(task.assigned_agent.clone()));
            }
            (tasks, false)
        };
        state = SessionState::of(session).unwrap_or(state);

        let groups = execution_groups(&tasks);
        session.progress = 5;
        sink.emit(EventKind::DecompositionComplete {
            tasks: tasks.len(),
            groups: groups.len(),
            fallback,
            progress: 5,
        });

        let aggregate = SessionAggregate::spawn(session);
        let ctx = Arc::new(RunContext {
            session_id: session.id.clone(),
            session_task: session.task.clone(),
            repo: Arc::clone(&self.repo),
            executor: Arc::clone(&self.executor),
            archivist: Arc::clone(&self.archivist),
            profiles: Arc::clone(profiles),
            sink: sink.clone(),
            usage: aggregate.recorder(),
            cancel: cancel.clone(),
            progress: Mutex::new(Progress {
                terminal: 0,
                total: tasks.len(),
            }),
            runtime: self.runtime.clone(),
            costs: Arc::clone(&self.costs),
        });

        let executed = self.run_groups(session, &mut state, &ctx, groups, concurrency).await;
        let totals = aggregate.flush().await;
        session.tokens_used = totals.tokens_used;
        session.cost_micros = totals.cost_micros;
        session.progress = ctx.progress_value();
        executed?;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled("research cancelled".to_string()));
        }

        match cancellable(cancel, self.archivist.full_pass(&session.id)).await? {
            Ok(report) => debug!(
                session_id = %session.id,
                findings = report.findings,
                contradictions = report.contradictions.len(),
                "insights recomputed"
            ),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "archivist full pass failed");
                sink.emit(EventKind::Error {
                    message: format!("archivist full pass failed: {}", e),
                    task_id: None,
                    agent: None,
                });
            }
        }

        advance(session, &mut state, SessionState::Synthesizing)?;
        session.progress = 95;
        self.repo.update_session(session).await?;
        sink.emit(EventKind::SynthesisStarted { progress: 95 });

        let synthesis = cancellable(cancel, self.synthesize(session, profiles)).await?;
        ctx.usage.record(Usage {
            tokens: synthesis.tokens_used,
            cost_micros: ctx.cost(&synthesis.model, synthesis.tokens_used),
        });
        sink.emit(EventKind::SynthesisComplete {
            tokens_used: synthesis.tokens_used,
            fallback: synthesis.fallback,
        });
        session.synthesis = Some(synthesis.report);

        let totals = aggregate.finish().await;
        session.tokens_used = totals.tokens_used;
        session.cost_micros = totals.cost_micros;
        advance(session, &mut state, SessionState::Completed)?;
        session.progress = 100;
        self.repo.update_session(session).await?;
        info!(
            session_id = %session.id,
            tokens = session.tokens_used,
            cost_micros = session.cost_micros,
            "research run completed"
        );
        sink.emit(EventKind::SessionCompleted {
            status: SessionStatus::Completed,
            progress: 100,
            tokens_used: session.tokens_used,
            cost_micros: session.cost_micros,
        });
        Ok(())
    }

    async fn run_groups(
        &self,
        session: &mut ResearchSession,
        state: &mut SessionState,
        ctx: &Arc<RunContext>,
        groups: Vec<Vec<ResearchTask>>,
        concurrency: usize,
    ) -> Result<()> {
        let mut remaining = groups.into_iter();
        while let Some(group) = remaining.next() {
            if ctx.cancel.is_cancelled() {
                for task in group.into_iter().chain(remaining.by_ref().flatten()) {
                    ctx.skip(task).await;
                }
                break;
            }
            let Some(number) = group.first().map(|t| t.execution_group) else {
                continue;
            };
            advance(session, state, SessionState::Executing { group: number })?;
            session.progress = ctx.progress_value();
            self.repo.update_session(session).await?;

            info!(session_id = %session.id, group = number, tasks = group.len(), "group started");
            ctx.sink.emit(EventKind::GroupStarted {
                group: number,
                task_ids: group.iter().map(|t| t.id.clone()).collect(),
            });

            let tally = self.run_group(ctx, group, concurrency).await;

            session.progress = ctx.progress_value();
            self.repo.update_session(session).await?;
            info!(
                session_id = %session.id,
                group = number,
                completed = tally.completed,
                failed = tally.failed,
                skipped = tally.skipped,
                "group completed"
            );
            ctx.sink.emit(EventKind::GroupCompleted {
                group: number,
                completed: tally.completed,
                failed: tally.failed,
                skipped: tally.skipped,
            });
        }
        Ok(())
    }

    /// Dispatch one group and wait at the barrier until every task is terminal
    async fn run_group(&self, ctx: &Arc<RunContext>, group: Vec<ResearchTask>, concurrency: usize) -> GroupTally {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, ResearchTask> = HashMap::new();
        let mut tally = GroupTally::default();

        let mut pending = group.into_iter();
        for task in pending.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                ctx.skip(task).await;
                tally.skipped += 1;
                break;
            };
            let handle = set.spawn(run_task(Arc::clone(ctx), task.clone(), permit));
            in_flight.insert(handle.id(), task);
        }
        for task in pending {
            ctx.skip(task).await;
            tally.skipped += 1;
        }

        let mut deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;
        loop {
            let grace = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                joined = set.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((id, outcome))) => {
                        in_flight.remove(&id);
                        tally.record(outcome);
                    }
                    Some(Err(err)) => {
                        let Some(task) = in_flight.remove(&err.id()) else {
                            continue;
                        };
                        let cause = if err.is_panic() {
                            error!(session_id = %ctx.session_id, task_id = %task.id, "task panicked");
                            AppError::Internal(format!("task {} panicked", task.id))
                        } else {
                            AppError::Cancelled(format!(
                                "task {} abandoned after the cancellation grace period",
                                task.id
                            ))
                        };
                        ctx.abandon(task, cause).await;
                        tally.failed += 1;
                    }
                },
                _ = ctx.cancel.cancelled(), if deadline.is_none() => {
                    info!(
                        session_id = %ctx.session_id,
                        in_flight = set.len(),
                        grace_secs = ctx.runtime.cancel_grace_secs,
                        "cancellation requested, waiting for in-flight tasks"
                    );
                    deadline = Some(tokio::time::Instant::now() + ctx.runtime.cancel_grace());
                }
                _ = grace, if deadline.is_some() && !aborted => {
                    warn!(session_id = %ctx.session_id, abandoned = set.len(), "grace period over, aborting in-flight tasks");
                    set.abort_all();
                    aborted = true;
                }
            }
        }
        tally
    }

    async fn synthesize(&self, session: &ResearchSession, profiles: &ProfileSet) -> Synthesis {
        let insights = match self.memory.entries(&session.id, MemoryLayer::Insight).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "cannot read insights for synthesis");
                Vec::new()
            }
        };
        let prompt = synthesis_prompt(session, &insights);
        let (model, request) = match profiles.get("scribe") {
            Some(scribe) => {
                let persona = if scribe.persona.trim().is_empty() {
                    SYNTHESIZER_PERSONA.to_string()
                } else {
                    scribe.persona.clone()
                };
                (
                    scribe.role_model.clone(),
                    CompletionRequest::new(scribe.role_model.clone(), prompt)
                        .with_system(persona)
                        .with_temperature(scribe.temperature)
                        .with_max_tokens(scribe.max_tokens),
                )
            }
            None => (
                self.decomposer_model.clone(),
                CompletionRequest::new(self.decomposer_model.clone(), prompt)
                    .with_system(SYNTHESIZER_PERSONA)
                    .with_temperature(0.5)
                    .with_max_tokens(SYNTHESIS_MAX_TOKENS),
            ),
        };

        let fallback = |tokens_used: u64| Synthesis {
            report: fallback_report(session, &insights),
            tokens_used,
            model: model.clone(),
            fallback: true,
        };
        match self.llm.complete(&request).await {
            Ok(c) if !c.content.trim().is_empty() => Synthesis {
                report: c.content,
                tokens_used: c.tokens_used,
                model: model.clone(),
                fallback: false,
            },
            Ok(c) => {
                warn!(session_id = %session.id, "synthesis model returned nothing, using fallback report");
                fallback(c.tokens_used)
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "synthesis model call failed, using fallback report");
                fallback(0)
            }
        }
    }
}
