//! Multi-agent research orchestration
//!
//! A research question becomes a session. The session is decomposed into a
//! dependency graph of subtasks, each bound to an agent profile; the graph
//! is layered into execution groups that run in order with a barrier
//! between them. Agent output lands in the tiered memory store, the
//! archivist promotes it to digests and insights, and a final synthesis
//! turns the insights into a report.
//!
//! # Architecture
//!
//! - [`decomposer`] - question to [`TaskSpec`](graph::TaskSpec)s, with a single-task fallback
//! - [`graph`] - validation and layering of the subtask DAG
//! - [`orchestrator::Orchestrator`] - session lifecycle, scheduling, cancellation and synthesis
//! - [`archivist::Archivist`] - L0 to L1 digests and L2 insights
//! - [`contradiction`] - pluggable cross-agent contradiction detection
//! - [`events`] - the ordered event stream of a run
//! - [`session`] - state machine and the usage aggregate
//!
//! # Usage
//!
//! ```ignore
//! use nexen::research::{ExecuteOptions, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(&config, llm, repo, memory);
//! let session = orchestrator
//!     .create_session("local", "SSM survey", "Compare Transformers and state-space models")
//!     .await?;
//!
//! let mut run = orchestrator
//!     .execute(&session.id, registry.snapshot("local"), ExecuteOptions::default())
//!     .await?;
//! while let Some(event) = run.next().await {
//!     println!("{} {}", event.seq, event.kind.name());
//! }
//! let session = run.join().await?;
//! println!("{}", session.synthesis.unwrap_or_default());
//! ```

/// Digest and insight maintenance.
pub mod archivist;
/// Cross-agent contradiction detection.
pub mod contradiction;
/// Research question decomposition.
pub mod decomposer;
/// Run events and the ordered sink.
pub mod events;
/// Subtask graph validation and layering.
pub mod graph;
/// Session scheduling and synthesis.
pub mod orchestrator;
/// Session state machine and counters.
pub mod session;

pub use archivist::{Archivist, ArchivistReport, Digest, DigestUpdate};
pub use contradiction::{
    AttributedPoint, Contradiction, ContradictionDetector, ContradictionKind, KeywordNegationDetector,
};
pub use decomposer::{Decomposition, LlmDecomposer, TaskDecomposer, TaskGraph, TaskGraphBuilder};
pub use events::{EventKind, EventSink, ResearchEvent};
pub use graph::{Placement, TaskSpec};
pub use orchestrator::{ExecuteOptions, Orchestrator, ResearchRun, MAX_AGENTS};
pub use session::{CounterSnapshot, SessionAggregate, SessionState, Usage, UsageRecorder};
