//! Init command implementation
//!
//! Scaffolds a Nexen project: `nexen.toml`, `.env.example`, `.gitignore`
//! and the memory workspace directory.

use super::output::Output;
use std::fs;
use std::path::Path;

/// Result of the init operation
pub enum InitResult {
    /// Initialization completed successfully
    Success,
    /// Project already exists (nexen.toml found)
    AlreadyExists,
    /// An error occurred during initialization
    Error(String),
}

/// Configuration for the init command
pub struct InitConfig {
    /// Directory to initialize
    pub path: std::path::PathBuf,
    /// Overwrite existing files
    pub force: bool,
    /// LLM provider to configure (ollama, openai, or both)
    pub provider: String,
}

/// Run the init command
pub fn run(config: InitConfig, output: &Output) -> InitResult {
    output.banner();
    output.header("Initializing Nexen Project");

    let base_path = &config.path;

    let config_path = base_path.join("nexen.toml");
    if config_path.exists() && !config.force {
        output.warning("nexen.toml already exists!");
        output.hint("Use --force to overwrite existing files");
        return InitResult::AlreadyExists;
    }

    output.subheader("Creating directories");
    for dir in ["data", "data/workspaces"] {
        let dir_path = base_path.join(dir);
        if dir_path.exists() {
            output.skipped(dir, "already exists");
            continue;
        }
        if let Err(e) = fs::create_dir_all(&dir_path) {
            output.error(&format!("Failed to create {}: {}", dir, e));
            return InitResult::Error(e.to_string());
        }
        output.created_dir(dir);
    }

    output.subheader("Creating configuration files");

    let toml_content = generate_nexen_toml(&config);
    if let Err(e) = write_file(&config_path, &toml_content, config.force) {
        output.error(&format!("Failed to create nexen.toml: {}", e));
        return InitResult::Error(e.to_string());
    }
    output.created("config", "nexen.toml");

    let env_example_path = base_path.join(".env.example");
    if let Err(e) = write_file(&env_example_path, &generate_env_example(), config.force) {
        output.error(&format!("Failed to create .env.example: {}", e));
        return InitResult::Error(e.to_string());
    }
    output.created("env", ".env.example");

    let gitignore_path = base_path.join(".gitignore");
    if !gitignore_path.exists() {
        if let Err(e) = write_file(&gitignore_path, &generate_gitignore(), false) {
            output.warning(&format!("Failed to create .gitignore: {}", e));
        } else {
            output.created("file", ".gitignore");
        }
    }

    output.complete("Nexen project initialized successfully!");

    output.header("Next Steps");
    output.newline();
    if config.provider != "ollama" {
        output.info("1. Set up environment variables:");
        output.command("cp .env.example .env");
        output.command("# Edit .env and set OPENAI_API_KEY");
        output.newline();
    } else {
        output.info("1. Start Ollama (if not running):");
        output.command("ollama serve");
        output.command("ollama pull llama3.2:3b  # or your preferred model");
        output.newline();
    }

    output.info("2. Run a research session:");
    output.command("nexen research \"How do state-space models compare to Transformers?\"");
    output.newline();

    output.hint("Inspect agent profiles with: nexen agents list");

    InitResult::Success
}

fn write_file(path: &Path, content: &str, force: bool) -> std::io::Result<()> {
    if path.exists() && !force {
        return Ok(()); // Skip existing files unless force is true
    }
    fs::write(path, content)
}

fn generate_nexen_toml(config: &InitConfig) -> String {
    let provider_section = if config.provider == "openai" {
        r#"# OpenAI API (set OPENAI_API_KEY in .env)
[providers.openai]
type = "openai"
api_key_env = "OPENAI_API_KEY"
api_base = "https://api.openai.com/v1"
default_model = "gpt-4o-mini"
"#
    } else if config.provider == "both" {
        r#"# Ollama - Local inference
[providers.local]
type = "ollama"
base_url = "http://localhost:11434"
default_model = "llama3.2:3b"

# OpenAI API (set OPENAI_API_KEY in .env)
[providers.openai]
type = "openai"
api_key_env = "OPENAI_API_KEY"
api_base = "https://api.openai.com/v1"
default_model = "gpt-4o-mini"
"#
    } else {
        r#"# Ollama - Local inference (no API key required)
[providers.local]
type = "ollama"
base_url = "http://localhost:11434"
default_model = "llama3.2:3b"
"#
    };

    // Primary models go to OpenAI when it is configured, fallbacks stay local
    // when both providers exist
    let (primary_provider, primary_model, primary_cost) = match config.provider.as_str() {
        "openai" | "both" => ("openai", "gpt-4o", 5000),
        _ => ("local", "llama3.2:3b", 0),
    };
    let (mini_provider, mini_model, mini_cost) = match config.provider.as_str() {
        "openai" | "both" => ("openai", "gpt-4o-mini", 300),
        _ => ("local", "llama3.2:3b", 0),
    };
    let (fallback_provider, fallback_model, fallback_cost) = match config.provider.as_str() {
        "openai" => ("openai", "gpt-4o-mini", 300),
        _ => ("local", "llama3.2:3b", 0),
    };

    format!(
        r#"# Nexen Configuration
# ===================
# Generated by: nexen init

# =============================================================================
# Runtime
# =============================================================================
[runtime]
max_concurrency = 5
task_timeout_secs = 300
retry_budget = 1
cancel_grace_secs = 10

# =============================================================================
# Memory workspace (one directory per session)
# =============================================================================
[memory]
workspace = "./data/workspaces"
write_retries = 3
retry_backoff_ms = 200

# =============================================================================
# Decomposer
# =============================================================================
[decomposer]
model = "planner"
max_subtasks = 5
temperature = 0.3

# =============================================================================
# Archivist
# =============================================================================
[archivist]
max_findings = 10
max_questions = 10
max_points_per_section = 50

# =============================================================================
# Logging (RUST_LOG overrides the level)
# =============================================================================
[logging]
level = "info"
json = false

# =============================================================================
# LLM Providers
# =============================================================================
{provider_section}
# =============================================================================
# Models
# =============================================================================
# The built-in agent profiles refer to these ids.

[models.planner]
provider = "{primary_provider}"
model = "{primary_model}"
cost_per_1k_tokens_micros = {primary_cost}

[models."openai/gpt-4o"]
provider = "{primary_provider}"
model = "{primary_model}"
cost_per_1k_tokens_micros = {primary_cost}

[models."openai/gpt-4o-mini"]
provider = "{mini_provider}"
model = "{mini_model}"
cost_per_1k_tokens_micros = {mini_cost}

[models."google/gemini-2.0-pro"]
provider = "{fallback_provider}"
model = "{fallback_model}"
cost_per_1k_tokens_micros = {fallback_cost}

[models."google/gemini-2.0-flash"]
provider = "{fallback_provider}"
model = "{fallback_model}"
cost_per_1k_tokens_micros = {fallback_cost}
"#,
        provider_section = provider_section,
        primary_provider = primary_provider,
        primary_model = primary_model,
        primary_cost = primary_cost,
        mini_provider = mini_provider,
        mini_model = mini_model,
        mini_cost = mini_cost,
        fallback_provider = fallback_provider,
        fallback_model = fallback_model,
        fallback_cost = fallback_cost,
    )
}

fn generate_env_example() -> String {
    r#"# Nexen Environment Variables
# ===========================
# Copy this file to .env and fill in the values.

# Optional: Logging filter (trace, debug, info, warn, error)
RUST_LOG=info,nexen=debug

# Optional: OpenAI API key (if using the OpenAI provider)
# OPENAI_API_KEY=sk-...
"#
    .to_string()
}

fn generate_gitignore() -> String {
    r#"# Nexen Generated Files
/data/

# Environment
.env
.env.local
.env.*.local

# Rust
/target/

# OS
.DS_Store
Thumbs.db
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::toml_config::NexenConfig;
    use rstest::rstest;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir, provider: &str, force: bool) -> InitConfig {
        InitConfig {
            path: temp_dir.path().to_path_buf(),
            force,
            provider: provider.to_string(),
        }
    }

    #[rstest]
    #[case("ollama")]
    #[case("openai")]
    #[case("both")]
    fn test_generated_toml_is_a_valid_config(#[case] provider: &str) {
        let config = InitConfig {
            path: std::path::PathBuf::from("/tmp"),
            force: false,
            provider: provider.to_string(),
        };
        let content = generate_nexen_toml(&config);
        let parsed = NexenConfig::parse(&content).expect("generated config must parse");

        assert_eq!(parsed.decomposer.model, "planner");
        assert!(parsed.can_resolve_model("openai/gpt-4o"));
        assert!(parsed.can_resolve_model("google/gemini-2.0-pro"));
        assert!(parsed.can_resolve_model("openai/gpt-4o-mini"));
    }

    #[test]
    fn test_generate_nexen_toml_openai() {
        let config = InitConfig {
            path: std::path::PathBuf::from("/tmp"),
            force: false,
            provider: "openai".to_string(),
        };
        let content = generate_nexen_toml(&config);

        assert!(content.contains("[providers.openai]"));
        assert!(!content.contains("[providers.local]"));
        assert!(content.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_generate_env_example() {
        let content = generate_env_example();
        assert!(content.contains("RUST_LOG"));
        assert!(content.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_write_file_skips_existing_without_force() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let file_path = temp_dir.path().join("test.txt");
        fs::write(&file_path, "original").expect("Failed to write");

        write_file(&file_path, "new content", false).unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "original");

        write_file(&file_path, "new content", true).unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "new content");
    }

    #[test]
    fn test_run_creates_all_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let result = run(create_test_config(&temp_dir, "ollama", false), &Output::no_color());

        assert!(matches!(result, InitResult::Success));
        assert!(temp_dir.path().join("nexen.toml").exists());
        assert!(temp_dir.path().join(".env.example").exists());
        assert!(temp_dir.path().join(".gitignore").exists());
        assert!(temp_dir.path().join("data/workspaces").is_dir());
        assert!(NexenConfig::load(temp_dir.path().join("nexen.toml")).is_ok());
    }

    #[test]
    fn test_run_already_exists_without_force() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("nexen.toml"), "existing").expect("Failed to write");

        let result = run(create_test_config(&temp_dir, "ollama", false), &Output::no_color());
        assert!(matches!(result, InitResult::AlreadyExists));
    }

    #[test]
    fn test_run_force_overwrites() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("nexen.toml"), "existing").expect("Failed to write");

        let result = run(create_test_config(&temp_dir, "ollama", true), &Output::no_color());
        assert!(matches!(result, InitResult::Success));

        let content = fs::read_to_string(temp_dir.path().join("nexen.toml")).expect("Failed to read");
        assert!(content.contains("[runtime]"));
        assert!(!content.contains("existing"));
    }
}
