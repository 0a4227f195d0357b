/// Deterministic keyword and normalization helpers.
pub mod text;
/// TOML configuration (`nexen.toml`).
pub mod toml_config;
