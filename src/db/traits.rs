//! Repository abstraction for research state.
//!
//! The orchestrator persists sessions, task graphs and execution records
//! through [`ResearchRepository`]. The storage technology is left to the
//! implementation; [`super::InMemoryRepository`] is the bundled one.
//!
//! # Example
//!
//! ```rust,ignore
//! use nexen::db::{InMemoryRepository, ResearchRepository};
//!
//! let repo = InMemoryRepository::new();
//! repo.create_session(&session).await?;
//! let running = repo.list_sessions("local", Some(SessionStatus::Running)).await?;
//! ```

use crate::types::{AgentExecution, ResearchSession, ResearchTask, Result, SessionStatus};
use async_trait::async_trait;

/// Editable session fields
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Abstract trait for research persistence
///
/// Implementations must make [`replace_tasks`](Self::replace_tasks) atomic:
/// either every task of the new graph is stored or none is.
#[async_trait]
pub trait ResearchRepository: Send + Sync {
    // ============== Session Operations ==============

    /// Store a new session; a duplicate id is a conflict
    async fn create_session(&self, session: &ResearchSession) -> Result<()>;

    /// Get a session by ID
    async fn get_session(&self, id: &str) -> Result<Option<ResearchSession>>;

    /// Sessions of an owner, newest first, optionally filtered by status
    async fn list_sessions(
        &self,
        owner_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<ResearchSession>>;

    /// Overwrite a stored session (orchestrator bookkeeping)
    async fn update_session(&self, session: &ResearchSession) -> Result<()>;

    /// Change name and/or description
    async fn patch_session(&self, id: &str, patch: SessionPatch) -> Result<ResearchSession>;

    /// Soft delete; refused while the session is running
    async fn archive_session(&self, id: &str) -> Result<ResearchSession>;

    /// Hard delete with its tasks and executions; refused while running
    async fn delete_session(&self, id: &str) -> Result<()>;

    // ============== Task Operations ==============

    /// Atomically replace a session's whole task graph
    async fn replace_tasks(&self, session_id: &str, tasks: &[ResearchTask]) -> Result<()>;

    /// Tasks of a session ordered by group, then order
    async fn list_tasks(&self, session_id: &str) -> Result<Vec<ResearchTask>>;

    /// Overwrite one stored task
    async fn update_task(&self, task: &ResearchTask) -> Result<()>;

    // ============== Execution Operations ==============

    /// Insert or update an execution; terminal records are immutable
    async fn upsert_execution(&self, execution: &AgentExecution) -> Result<()>;

    /// Executions of a session in start order, optionally for one task
    async fn list_executions(
        &self,
        session_id: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<AgentExecution>>;
}
