//! Task decomposition: research question in, validated task graph out.

use super::graph::{build_tasks, TaskSpec};
use crate::agents::defaults::{capability_of, DEFAULT_AGENTS};
use crate::agents::{assign_agent_for_task, ProfileSet};
use crate::llm::{extract_json_object, CompletionRequest, LLMClient};
use crate::types::{AppError, Priority, ResearchTask, Result};
use crate::utils::toml_config::DecomposerConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Proposed subtasks plus what it cost to get them
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub specs: Vec<TaskSpec>,
    pub tokens_used: u64,
    /// True when the single-task fallback was used
    pub fallback: bool,
}

/// Breaks a research question into subtasks for the enabled agents
#[async_trait]
pub trait TaskDecomposer: Send + Sync {
    async fn decompose(&self, task: &str, profiles: &ProfileSet) -> Result<Decomposition>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct WirePlan {
    #[serde(default)]
    subtasks: Vec<WireSubtask>,
}

#[derive(Debug, Deserialize)]
struct WireSubtask {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "agent")]
    assigned_agent: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, alias = "dependencies")]
    depends_on: Vec<Value>,
    #[serde(default)]
    parent: Option<Value>,
}

/// Ids may come back as strings or numbers
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a model answer into specs, keeping at most `max_subtasks`
fn parse_plan(text: &str, max_subtasks: usize) -> Option<Vec<TaskSpec>> {
    let json = extract_json_object(text)?;
    let plan: WirePlan = serde_json::from_str(json).ok()?;
    if plan.subtasks.is_empty() {
        return None;
    }

    let subtasks: Vec<WireSubtask> = plan.subtasks.into_iter().take(max_subtasks).collect();
    // Id-less subtasks are numbered by position, skipping ids already claimed
    let mut taken: HashSet<String> = subtasks
        .iter()
        .filter_map(|st| st.id.as_ref().and_then(id_string))
        .collect();

    let specs = subtasks
        .into_iter()
        .enumerate()
        .map(|(i, st)| {
            let id = match st.id.as_ref().and_then(id_string) {
                Some(id) => id,
                None => {
                    let mut n = i + 1;
                    while taken.contains(&n.to_string()) {
                        n += 1;
                    }
                    taken.insert(n.to_string());
                    n.to_string()
                }
            };
            let priority = match st.priority.as_deref() {
                Some(p) => p.parse::<Priority>().unwrap_or_else(|_| {
                    debug!(priority = p, "unknown priority, using medium");
                    Priority::Medium
                }),
                None => Priority::Medium,
            };
            let description = st
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("Subtask {}", i + 1));
            TaskSpec {
                id,
                description,
                assigned_agent: st
                    .assigned_agent
                    .map(|a| a.trim().to_string())
                    .unwrap_or_else(|| "explorer".to_string()),
                priority,
                depends_on: st.depends_on.iter().filter_map(id_string).collect(),
                parent: st.parent.as_ref().and_then(id_string),
            }
        })
        .collect();
    Some(specs)
}

/// Agent for the single-task fallback: keyword rules, then the first
/// enabled agent in template order, then any enabled agent
pub fn fallback_agent(task: &str, profiles: &ProfileSet) -> Result<String> {
    let preferred = assign_agent_for_task(task);
    if profiles.contains(preferred) {
        return Ok(preferred.to_string());
    }
    DEFAULT_AGENTS
        .iter()
        .map(|t| t.agent_type)
        .find(|a| profiles.contains(a))
        .map(str::to_string)
        .or_else(|| profiles.iter().next().map(|p| p.agent_type.clone()))
        .ok_or_else(|| AppError::decomposition("no enabled agents"))
}

/// Single high-priority task covering the whole question
pub fn fallback_plan(task: &str, profiles: &ProfileSet) -> Result<Vec<TaskSpec>> {
    let agent = fallback_agent(task, profiles)?;
    Ok(vec![TaskSpec::new("1", task.trim(), agent).with_priority(Priority::High)])
}

/// Model-backed decomposer with a single-task fallback
pub struct LlmDecomposer {
    llm: Arc<dyn LLMClient>,
    config: DecomposerConfig,
}

impl LlmDecomposer {
    pub fn new(llm: Arc<dyn LLMClient>, config: DecomposerConfig) -> Self {
        Self { llm, config }
    }

    fn system_prompt(&self, profiles: &ProfileSet) -> String {
        let mut out = String::from(
            "You are a research task decomposition expert. Break the user's research \
             task into concrete subtasks. Each subtask must have a clear goal and be \
             assignable to exactly one agent.\n\n## Available Agents\n",
        );
        for profile in profiles.iter() {
            let capability = capability_of(&profile.agent_type)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if profile.responsibilities.is_empty() {
                        profile.display_name.clone()
                    } else {
                        profile.responsibilities.join("; ")
                    }
                });
            let _ = writeln!(out, "- {}: {}", profile.agent_type, capability);
        }
        let _ = write!(
            out,
            "\nReply with JSON only:\n\
             {{\"subtasks\": [{{\"id\": \"1\", \"description\": \"...\", \"assigned_agent\": \"explorer\", \
             \"priority\": \"critical|high|medium|low\", \"depends_on\": [], \"parent\": null}}]}}\n\
             Use at most {} subtasks. `depends_on` lists ids of subtasks whose results are needed first; \
             leave it empty when a subtask can start immediately.\n",
            self.config.max_subtasks
        );
        out
    }
}

#[async_trait]
impl TaskDecomposer for LlmDecomposer {
    #[instrument(skip(self, task, profiles), fields(model = %self.config.model))]
    async fn decompose(&self, task: &str, profiles: &ProfileSet) -> Result<Decomposition> {
        if task.trim().is_empty() {
            return Err(AppError::decomposition("research task is empty"));
        }
        if profiles.is_empty() {
            return Err(AppError::decomposition("no enabled agents"));
        }

        let request = CompletionRequest::new(
            self.config.model.clone(),
            format!(
                "Decompose the following research task (at most {} subtasks):\n\n{}",
                self.config.max_subtasks,
                task.trim()
            ),
        )
        .with_system(self.system_prompt(profiles))
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let (answer, tokens_used) = match self.llm.complete(&request).await {
            Ok(c) => (Some(c.content), c.tokens_used),
            Err(e) => {
                warn!(error = %e, "decomposition model call failed, falling back to a single task");
                (None, 0)
            }
        };

        if let Some(specs) = answer
            .as_deref()
            .and_then(|a| parse_plan(a, self.config.max_subtasks))
        {
            info!(subtasks = specs.len(), "task decomposed");
            return Ok(Decomposition {
                specs,
                tokens_used,
                fallback: false,
            });
        }
        if answer.is_some() {
            warn!("decomposition answer did not parse, falling back to a single task");
        }
        Ok(Decomposition {
            specs: fallback_plan(task, profiles)?,
            tokens_used,
            fallback: true,
        })
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// A validated, layered task set ready to persist
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub tasks: Vec<ResearchTask>,
    pub tokens_used: u64,
    pub fallback: bool,
}

impl TaskGraph {
    pub fn group_count(&self) -> usize {
        self.tasks
            .iter()
            .map(|t| t.execution_group as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Runs a decomposer and validates its proposal into a task graph.
///
/// Validation failures (unknown or disabled agent, dangling dependency,
/// cycle) are errors; only model failures fall back.
pub struct TaskGraphBuilder {
    decomposer: Arc<dyn TaskDecomposer>,
}

impl TaskGraphBuilder {
    pub fn new(decomposer: Arc<dyn TaskDecomposer>) -> Self {
        Self { decomposer }
    }

    pub async fn build(&self, session_id: &str, task: &str, profiles: &ProfileSet) -> Result<TaskGraph> {
        let decomposition = self.decomposer.decompose(task, profiles).await?;
        let tasks = build_tasks(session_id, &decomposition.specs, profiles)?;
        Ok(TaskGraph {
            tasks,
            tokens_used: decomposition.tokens_used,
            fallback: decomposition.fallback,
        })
    }
}
