//! CLI module for Nexen
//!
//! Provides command-line interface parsing and handling for the nexen binary.
//! Uses clap for argument parsing and owo-colors for colored terminal output.

pub mod commands;
pub mod init;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Nexen - multi-agent research orchestration
///
/// Decomposes a research question into dependent subtasks, runs specialist
/// agents over them in parallel and synthesizes a report.
#[derive(Parser, Debug)]
#[command(
    name = "nexen",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "Nexen - multi-agent research orchestration",
    long_about = "Decomposes a research question into a dependency graph of subtasks,\n\
                  runs specialist agents over it with bounded parallelism, keeps a tiered\n\
                  memory workspace per session and synthesizes a final report.",
    after_help = "EXAMPLES:\n    \
                  nexen init                                   # Scaffold nexen.toml\n    \
                  nexen research \"Compare Transformers and SSMs\" # Run a session\n    \
                  nexen agents list --cluster reasoning        # Browse agent profiles\n    \
                  nexen memory ls <session-id> --layer l2      # Browse session memory"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "nexen.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Nexen project with a configuration file
    Init {
        /// Directory to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite existing files without prompting
        #[arg(short, long)]
        force: bool,

        /// LLM provider to configure (ollama, openai, or both)
        #[arg(long, default_value = "ollama")]
        provider: String,
    },

    /// Show configuration information
    Config {
        /// Show the full configuration
        #[arg(short = 'f', long)]
        full: bool,

        /// Validate the configuration file
        #[arg(long)]
        validate: bool,
    },

    /// Run a research session and stream its events
    Research {
        /// The research question
        task: String,

        /// Session name (defaults to the start of the question)
        #[arg(short, long, default_value = "")]
        name: String,

        /// Owner whose agent profiles are used
        #[arg(long, default_value = crate::agents::DEFAULT_OWNER)]
        owner: String,

        /// Concurrent agents for this run (1-14)
        #[arg(short, long, default_value_t = 5)]
        max_agents: usize,
    },

    /// Inspect agent profiles
    #[command(subcommand)]
    Agents(AgentCommands),

    /// Browse session memory
    #[command(subcommand)]
    Memory(MemoryCommands),
}

/// Agent profile subcommands
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// List agent profiles
    List {
        /// Only show one cluster (coordination, reasoning, information, production)
        #[arg(long)]
        cluster: Option<String>,
    },

    /// Show details for a specific agent
    Show {
        /// Agent type, e.g. `explorer`
        agent_type: String,
    },

    /// Run a one-off prompt through an agent's persona and model
    Test {
        /// Agent type, e.g. `explorer`
        agent_type: String,

        /// Prompt to send
        task: String,
    },
}

/// Memory browsing subcommands
#[derive(Subcommand, Debug)]
pub enum MemoryCommands {
    /// List the records of a session
    Ls {
        /// Session id
        session: String,

        /// Only one layer (l0, l1, l2)
        #[arg(long)]
        layer: Option<String>,
    },

    /// Print one memory file
    Cat {
        /// Path, absolute or relative to the workspace root
        path: PathBuf,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
