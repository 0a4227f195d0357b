use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ============= Session Types =============

/// Persisted status of a research session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet executing
    Active,
    /// Orchestrator is working on it
    Running,
    /// Terminal: synthesis produced
    Completed,
    /// Terminal: decomposition error, internal fault or cancellation
    Failed,
    /// Soft-deleted by the user
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(AppError::InvalidInput(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// Why a session ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Error,
    Cancelled,
}

/// A research question under investigation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Free-text research question handed to the decomposer
    pub task: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    /// Human readable stage label (`decomposing`, `executing group 1`, ...)
    pub stage: String,
    /// 0..=100
    pub progress: u8,
    pub tokens_used: u64,
    /// Accumulated cost in micro-dollars
    pub cost_micros: u64,
    pub workspace: PathBuf,
    pub synthesis: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchSession {
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        task: impl Into<String>,
        workspace_root: &std::path::Path,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            workspace: workspace_root.join(&id),
            id,
            owner_id: owner_id.into(),
            name: name.into(),
            task: task.into(),
            description: None,
            status: SessionStatus::Active,
            stage: "created".to_string(),
            progress: 0,
            tokens_used: 0,
            cost_micros: 0,
            synthesis: None,
            failure_reason: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.failure_reason == Some(FailureReason::Cancelled)
    }
}

// ============= Task Graph Types =============

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Lower rank runs first inside a group
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(AppError::InvalidInput(format!("unknown priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a session's task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub description: String,
    pub assigned_agent: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    /// Position inside the execution group
    pub execution_order: u32,
    pub execution_group: u32,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============= Agent Execution Types =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// Best-effort structure pulled out of an agent's raw output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredOutput {
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub uncertainties: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl StructuredOutput {
    pub fn is_empty(&self) -> bool {
        self.key_findings.is_empty()
            && self.uncertainties.is_empty()
            && self.suggestions.is_empty()
            && self.references.is_empty()
    }

    /// Heuristic confidence: findings raise it, uncertainties lower it.
    pub fn confidence(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let score = 0.3 + 0.1 * self.key_findings.len() as f32
            - 0.05 * self.uncertainties.len() as f32;
        score.clamp(0.0, 1.0)
    }
}

/// One concrete run of an agent against one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: String,
    pub session_id: String,
    pub task_id: String,
    pub profile_id: Option<String>,
    pub agent_type: String,
    pub agent_name: String,
    pub task_description: String,
    pub status: ExecutionStatus,
    /// Keys and token counts of the context bundle the agent saw
    pub input_context: Option<String>,
    pub output: Option<String>,
    pub structured_output: StructuredOutput,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub confidence: f32,
    pub model_used: Option<String>,
    /// Set before the L0 write starts, so an attempt abandoned mid-write
    /// still points at its audit record
    pub raw_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentExecution {
    pub fn pending(task: &ResearchTask, profile_id: Option<String>, agent_name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: task.session_id.clone(),
            task_id: task.id.clone(),
            profile_id,
            agent_type: task.assigned_agent.clone(),
            agent_name: agent_name.to_string(),
            task_description: task.description.clone(),
            status: ExecutionStatus::Pending,
            input_context: None,
            output: None,
            structured_output: StructuredOutput::default(),
            tokens_used: 0,
            duration_ms: 0,
            confidence: 0.0,
            model_used: None,
            raw_path: None,
            error_message: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Close the record as failed; a terminal record is left untouched
    pub fn fail(&mut self, error: &AppError) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }
}

// ============= Error Types =============

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Decomposition error: {message}")]
    Decomposition {
        /// The unknown or disabled agent, when that is the cause
        agent: Option<String>,
        message: String,
    },

    #[error("Execution error in task {task_id} ({agent}): {message}")]
    Execution {
        task_id: String,
        agent: String,
        message: String,
    },

    #[error("Task {task_id} ({agent}) timed out after {after_secs}s")]
    Timeout {
        task_id: String,
        agent: String,
        after_secs: u64,
    },

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("LLM error: {0}")]
    LLM(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn decomposition(message: impl Into<String>) -> Self {
        AppError::Decomposition {
            agent: None,
            message: message.into(),
        }
    }

    /// Decomposition failure caused by a task bound to an agent outside the enabled set
    pub fn missing_agent(agent: impl Into<String>) -> Self {
        let agent = agent.into();
        AppError::Decomposition {
            message: format!("agent '{}' is unknown or disabled", agent),
            agent: Some(agent),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }

    /// Errors worth another attempt on the fallback model
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::LLM(_)
                | AppError::Timeout { .. }
                | AppError::Execution { .. }
                | AppError::Configuration(_)
        )
    }

    /// Originating task and agent, where applicable
    pub fn task_context(&self) -> Option<(&str, &str)> {
        match self {
            AppError::Execution { task_id, agent, .. } | AppError::Timeout { task_id, agent, .. } => {
                Some((task_id.as_str(), agent.as_str()))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_is_rank_order() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort_by_key(|p| p.rank());
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_priority_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_session_status_round_trip_str() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(StructuredOutput::default().confidence(), 0.0);

        let many = StructuredOutput {
            key_findings: vec!["a".into(); 20],
            ..Default::default()
        };
        assert_eq!(many.confidence(), 1.0);

        let unsure = StructuredOutput {
            uncertainties: vec!["u".into(); 20],
            ..Default::default()
        };
        assert_eq!(unsure.confidence(), 0.0);
    }

    #[test]
    fn test_missing_agent_names_the_agent() {
        let err = AppError::missing_agent("vision_analyst");
        assert!(err.to_string().contains("vision_analyst"));
        match err {
            AppError::Decomposition { agent, .. } => {
                assert_eq!(agent.as_deref(), Some("vision_analyst"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::LLM("rate limited".into()).is_retryable());
        assert!(AppError::Timeout {
            task_id: "t".into(),
            agent: "a".into(),
            after_secs: 1
        }
        .is_retryable());
        assert!(!AppError::Memory("disk".into()).is_retryable());
        assert!(!AppError::Cancelled("user".into()).is_retryable());
    }
}
