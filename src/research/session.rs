//! Session lifecycle and counters.

use crate::types::{AppError, FailureReason, ResearchSession, Result, SessionStatus};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Orchestrator state of a session.
///
/// `created → decomposing → planned → executing(group) → synthesizing →
/// completed | failed`. `planned` is the resting state between an explicit
/// decomposition and execution; re-decomposition is only possible from
/// `created` or `planned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Decomposing,
    Planned,
    Executing { group: u32 },
    Synthesizing,
    Completed,
    Failed,
}

impl SessionState {
    /// Current state of a stored session; archived sessions have none
    pub fn of(session: &ResearchSession) -> Option<Self> {
        match session.status {
            SessionStatus::Archived => None,
            SessionStatus::Completed => Some(SessionState::Completed),
            SessionStatus::Failed => Some(SessionState::Failed),
            SessionStatus::Active | SessionStatus::Running => session.stage.parse().ok(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Created | SessionState::Decomposing | SessionState::Planned => {
                SessionStatus::Active
            }
            SessionState::Executing { .. } | SessionState::Synthesizing => SessionStatus::Running,
            SessionState::Completed => SessionStatus::Completed,
            SessionState::Failed => SessionStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether the task graph may still be (re)built
    pub fn allows_decomposition(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Planned)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Created | Planned, Decomposing) => true,
            (Decomposing, Planned) => true,
            (Planned, Executing { group: 0 }) => true,
            (Executing { group: a }, Executing { group: b }) => b > a,
            (Executing { .. }, Synthesizing) => true,
            (Synthesizing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move `session` into `next`, stamping stage, status and timestamps
    pub fn apply(&self, session: &mut ResearchSession, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "session {} cannot move from '{}' to '{}'",
                session.id, self, next
            )));
        }
        let now = Utc::now();
        session.stage = next.to_string();
        session.status = next.status();
        session.updated_at = now;
        if next.is_terminal() {
            session.completed_at = Some(now);
        }
        Ok(())
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => f.write_str("created"),
            SessionState::Decomposing => f.write_str("decomposing"),
            SessionState::Planned => f.write_str("planned"),
            SessionState::Executing { group } => write!(f, "executing group {}", group),
            SessionState::Synthesizing => f.write_str("synthesizing"),
            SessionState::Completed => f.write_str("completed"),
            SessionState::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for SessionState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(SessionState::Created),
            "decomposing" => Ok(SessionState::Decomposing),
            "planned" => Ok(SessionState::Planned),
            "synthesizing" => Ok(SessionState::Synthesizing),
            "completed" => Ok(SessionState::Completed),
            "failed" => Ok(SessionState::Failed),
            other => other
                .strip_prefix("executing group ")
                .and_then(|g| g.parse().ok())
                .map(|group| SessionState::Executing { group })
                .ok_or_else(|| AppError::InvalidInput(format!("unknown session stage '{}'", other))),
        }
    }
}

/// Mark a session failed with a reason and message
pub fn fail_session(session: &mut ResearchSession, reason: FailureReason, message: impl Into<String>) {
    let now = Utc::now();
    session.status = SessionStatus::Failed;
    session.stage = SessionState::Failed.to_string();
    session.failure_reason = Some(reason);
    session.error_message = Some(message.into());
    session.updated_at = now;
    session.completed_at = Some(now);
}

/// Linear task progress across 10..=90
pub fn task_progress(terminal: usize, total: usize) -> u8 {
    if total == 0 {
        return 90;
    }
    let done = terminal.min(total) as u64;
    (10 + done * 80 / total as u64) as u8
}

/// Tokens and cost of one finished model call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub tokens: u64,
    pub cost_micros: u64,
}

/// Point-in-time view of a session's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub tokens_used: u64,
    pub cost_micros: u64,
    pub completions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tokens_used: AtomicU64,
    cost_micros: AtomicU64,
    completions: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tokens_used: self.tokens_used.load(Ordering::Acquire),
            cost_micros: self.cost_micros.load(Ordering::Acquire),
            completions: self.completions.load(Ordering::Acquire),
        }
    }
}

enum Message {
    Usage(Usage),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle for reporting usage to the aggregate
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<Message>,
}

impl UsageRecorder {
    pub fn record(&self, usage: Usage) {
        if self.tx.send(Message::Usage(usage)).is_err() {
            tracing::warn!(tokens = usage.tokens, "session aggregate closed, usage dropped");
        }
    }
}

/// Single writer of a session's counters.
///
/// Usage notifications arrive over a channel and are applied by one task;
/// readers take lock-free snapshots at any time.
pub struct SessionAggregate {
    counters: Arc<Counters>,
    tx: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
}

impl SessionAggregate {
    /// Start the writer task, seeded with the session's existing totals
    pub fn spawn(session: &ResearchSession) -> Self {
        let counters = Arc::new(Counters {
            tokens_used: AtomicU64::new(session.tokens_used),
            cost_micros: AtomicU64::new(session.cost_micros),
            completions: AtomicU64::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer_counters = Arc::clone(&counters);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Usage(usage) => {
                        writer_counters.tokens_used.fetch_add(usage.tokens, Ordering::AcqRel);
                        writer_counters.cost_micros.fetch_add(usage.cost_micros, Ordering::AcqRel);
                        writer_counters.completions.fetch_add(1, Ordering::AcqRel);
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { counters, tx, writer }
    }

    pub fn recorder(&self) -> UsageRecorder {
        UsageRecorder { tx: self.tx.clone() }
    }

    /// Snapshot without waiting for queued notifications
    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Snapshot after every notification sent so far has been applied
    pub async fn flush(&self) -> CounterSnapshot {
        let (done, applied) = oneshot::channel();
        if self.tx.send(Message::Flush(done)).is_ok() {
            let _ = applied.await;
        }
        self.counters.snapshot()
    }

    /// Flush and stop the writer
    pub async fn finish(self) -> CounterSnapshot {
        let totals = self.flush().await;
        self.writer.abort();
        totals
    }
}
