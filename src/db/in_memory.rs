//! In-process repository backed by `parking_lot::RwLock`.

use super::traits::{ResearchRepository, SessionPatch};
use crate::types::{
    AgentExecution, AppError, ResearchSession, ResearchTask, Result, SessionStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, ResearchSession>,
    tasks: HashMap<String, Vec<ResearchTask>>,
    /// Per session, in insertion order
    executions: HashMap<String, Vec<AgentExecution>>,
}

/// Repository holding everything in memory; state is lost on drop
#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &str) -> AppError {
    AppError::NotFound(format!("session {}", id))
}

fn refuse_if_running(session: &ResearchSession, action: &str) -> Result<()> {
    if session.status == SessionStatus::Running {
        return Err(AppError::Conflict(format!(
            "cannot {} session {} while it is running",
            action, session.id
        )));
    }
    Ok(())
}

#[async_trait]
impl ResearchRepository for InMemoryRepository {
    async fn create_session(&self, session: &ResearchSession) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(format!("session {} already exists", session.id)));
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ResearchSession>> {
        Ok(self.tables.read().sessions.get(id).cloned())
    }

    async fn list_sessions(
        &self,
        owner_id: &str,
        status: Option<SessionStatus>,
    ) -> Result<Vec<ResearchSession>> {
        let tables = self.tables.read();
        let mut sessions: Vec<ResearchSession> = tables
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .filter(|s| status.map(|st| s.status == st).unwrap_or(true))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn update_session(&self, session: &ResearchSession) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| not_found(&session.id))?;
        *slot = session.clone();
        Ok(())
    }

    async fn patch_session(&self, id: &str, patch: SessionPatch) -> Result<ResearchSession> {
        let mut tables = self.tables.write();
        let session = tables.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(AppError::InvalidInput("session name must not be empty".to_string()));
            }
            session.name = name;
        }
        if let Some(description) = patch.description {
            session.description = Some(description);
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn archive_session(&self, id: &str) -> Result<ResearchSession> {
        let mut tables = self.tables.write();
        let session = tables.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        refuse_if_running(session, "archive")?;
        session.status = SessionStatus::Archived;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let session = tables.sessions.get(id).ok_or_else(|| not_found(id))?;
        refuse_if_running(session, "delete")?;
        tables.sessions.remove(id);
        tables.tasks.remove(id);
        tables.executions.remove(id);
        Ok(())
    }

    async fn replace_tasks(&self, session_id: &str, tasks: &[ResearchTask]) -> Result<()> {
        if let Some(stray) = tasks.iter().find(|t| t.session_id != session_id) {
            return Err(AppError::InvalidInput(format!(
                "task {} belongs to session {}, not {}",
                stray.id, stray.session_id, session_id
            )));
        }
        let mut tables = self.tables.write();
        let session = tables
            .sessions
            .get(session_id)
            .ok_or_else(|| not_found(session_id))?;
        refuse_if_running(session, "re-plan")?;

        let mut sorted = tasks.to_vec();
        sorted.sort_by_key(|t| (t.execution_group, t.execution_order));
        tables.tasks.insert(session_id.to_string(), sorted);
        Ok(())
    }

    async fn list_tasks(&self, session_id: &str) -> Result<Vec<ResearchTask>> {
        Ok(self
            .tables
            .read()
            .tasks
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_task(&self, task: &ResearchTask) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables
            .tasks
            .get_mut(&task.session_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task.id))
            .ok_or_else(|| AppError::NotFound(format!("task {}", task.id)))?;
        *slot = task.clone();
        Ok(())
    }

    async fn upsert_execution(&self, execution: &AgentExecution) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.sessions.contains_key(&execution.session_id) {
            return Err(not_found(&execution.session_id));
        }
        let records = tables.executions.entry(execution.session_id.clone()).or_default();
        match records.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) if existing.status.is_terminal() => Err(AppError::Conflict(format!(
                "execution {} is already {:?} and immutable",
                existing.id, existing.status
            ))),
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => {
                records.push(execution.clone());
                Ok(())
            }
        }
    }

    async fn list_executions(
        &self,
        session_id: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<AgentExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .executions
            .get(session_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|e| task_id.map(|t| e.task_id == t).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
