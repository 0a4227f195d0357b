//! Research run events.
//!
//! The orchestrator is the only producer. Every emission goes through one
//! [`EventSink`], which stamps a per-session sequence number under a lock
//! before handing the event to the channel, so channel order and `seq`
//! order agree even when concurrent tasks report progress.

use crate::agents::ExecutionStage;
use crate::types::SessionStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One entry in a session's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchEvent {
    pub session_id: String,
    /// Starts at 1 and increases by one per event
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted {
        task: String,
        max_agents: usize,
    },
    DecompositionComplete {
        tasks: usize,
        groups: usize,
        fallback: bool,
        progress: u8,
    },
    GroupStarted {
        group: u32,
        task_ids: Vec<String>,
    },
    GroupCompleted {
        group: u32,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    TaskStarted {
        task_id: String,
        agent: String,
        group: u32,
        attempt: u32,
        model: String,
    },
    TaskProgress {
        task_id: String,
        agent: String,
        stage: ExecutionStage,
    },
    TaskCompleted {
        task_id: String,
        agent: String,
        tokens_used: u64,
        duration_ms: u64,
        confidence: f32,
        progress: u8,
    },
    TaskFailed {
        task_id: String,
        agent: String,
        error: String,
        retry_count: u32,
        progress: u8,
    },
    SynthesisStarted {
        progress: u8,
    },
    SynthesisComplete {
        tokens_used: u64,
        /// True when the deterministic report was used
        fallback: bool,
    },
    SessionCompleted {
        status: SessionStatus,
        progress: u8,
        tokens_used: u64,
        cost_micros: u64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SessionStarted { .. } => "session_started",
            EventKind::DecompositionComplete { .. } => "decomposition_complete",
            EventKind::GroupStarted { .. } => "group_started",
            EventKind::GroupCompleted { .. } => "group_completed",
            EventKind::TaskStarted { .. } => "task_started",
            EventKind::TaskProgress { .. } => "task_progress",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::SynthesisStarted { .. } => "synthesis_started",
            EventKind::SynthesisComplete { .. } => "synthesis_complete",
            EventKind::SessionCompleted { .. } => "session_completed",
            EventKind::Error { .. } => "error",
        }
    }

    /// The task this event is about, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            EventKind::TaskStarted { task_id, .. }
            | EventKind::TaskProgress { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. } => Some(task_id),
            EventKind::Error { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }
}

struct SinkState {
    seq: u64,
    tx: mpsc::UnboundedSender<ResearchEvent>,
}

/// Serialized, sequence-stamping event producer
#[derive(Clone)]
pub struct EventSink {
    session_id: Arc<str>,
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    /// A sink and the receiving end of its channel
    pub fn channel(session_id: &str) -> (Self, mpsc::UnboundedReceiver<ResearchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            session_id: Arc::from(session_id),
            state: Arc::new(Mutex::new(SinkState { seq: 0, tx })),
        };
        (sink, rx)
    }

    /// Emit an event, returning its sequence number. A dropped receiver is
    /// not an error; the run continues without an audience.
    pub fn emit(&self, kind: EventKind) -> u64 {
        let mut state = self.state.lock();
        state.seq += 1;
        let event = ResearchEvent {
            session_id: self.session_id.to_string(),
            seq: state.seq,
            timestamp: Utc::now(),
            kind,
        };
        if state.tx.send(event).is_err() {
            tracing::trace!(session_id = %self.session_id, "event receiver dropped");
        }
        state.seq
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let event = ResearchEvent {
            session_id: "s".into(),
            seq: 3,
            timestamp: Utc::now(),
            kind: EventKind::TaskProgress {
                task_id: "t".into(),
                agent: "explorer".into(),
                stage: ExecutionStage::Model,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_progress");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["stage"], "model");
        assert_eq!(json["session_id"], "s");

        let back: ResearchEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_sink_sequences_across_clones() {
        let (sink, mut rx) = EventSink::channel("s");
        let other = sink.clone();
        sink.emit(EventKind::SynthesisStarted { progress: 95 });
        other.emit(EventKind::Error {
            message: "boom".into(),
            task_id: None,
            agent: None,
        });
        drop(sink);
        drop(other);

        let mut seqs = Vec::new();
        while let Some(event) = rx.recv().await {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_emit_without_receiver() {
        let (sink, rx) = EventSink::channel("s");
        drop(rx);
        assert_eq!(sink.emit(EventKind::SynthesisStarted { progress: 95 }), 1);
    }
}
