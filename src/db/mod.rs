//! Persistence for sessions, task graphs and execution records.
//!
//! - [`ResearchRepository`] - storage-agnostic async trait
//! - [`InMemoryRepository`] - in-process implementation used by the CLI and tests

/// In-process repository.
pub mod in_memory;
/// Repository trait.
pub mod traits;

pub use in_memory::InMemoryRepository;
pub use traits::{ResearchRepository, SessionPatch};
