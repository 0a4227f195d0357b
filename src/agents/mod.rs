//! Research agents
//!
//! An agent is data, not code: an [`AgentProfile`] (persona, traits, model
//! bindings, pipeline configuration) executed by the generic
//! [`AgentExecutor`]. Fourteen default profiles ship in [`defaults`]; owners
//! can clone, edit and add their own through the [`ProfileRegistry`].

/// The fourteen built-in templates and keyword-based agent assignment.
pub mod defaults;
/// Runs one task through prompt, memory, preprocessing and model stages.
pub mod executor;
/// Local context cleanup before the model call.
pub mod preprocess;
/// Profile model, pipeline configuration and validation.
pub mod profile;
/// System prompts and the generate, review, refine loop.
pub mod prompt;
/// Lock-free profile registry and per-run snapshots.
pub mod registry;
/// Structured extraction from raw agent output.
pub mod structured;

pub use defaults::{assign_agent_for_task, AgentTemplate, DEFAULT_AGENTS};
pub use executor::{AgentExecutor, AgentTestResult, ExecutionContext, ExecutionStage, ProgressFn};
pub use profile::{
    AgentProfile, CleanupTask, Cluster, MemoryStageConfig, NewProfile, PipelineConfig,
    PreprocessingConfig, ProfileUpdate, PromptStageConfig, TraitLevel,
};
pub use registry::{ProfileRegistry, ProfileSet, DEFAULT_OWNER};
