//! Colored output helpers for CLI
//!
//! Provides consistent, colored terminal output for the Nexen CLI, including
//! the one-line rendering of research events.

use crate::research::{EventKind, ResearchEvent};
use crate::types::SessionStatus;
use owo_colors::OwoColorize;

/// Output style configuration
pub struct Output {
    /// Whether to use colored output
    pub colored: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Output {
    /// Create a new output helper with colors enabled
    pub fn new() -> Self {
        Self { colored: true }
    }

    /// Create a new output helper with colors disabled
    pub fn no_color() -> Self {
        Self { colored: false }
    }

    /// Print the Nexen banner
    pub fn banner(&self) {
        if self.colored {
            println!(
                r#"
   {}
   {}
   {}
   {}
"#,
                " _ __   _____  _____ _ __  ".bright_cyan().bold(),
                "| '_ \\ / _ \\ \\/ / _ \\ '_ \\ ".cyan().bold(),
                "| | | |  __/>  <  __/ | | |".blue().bold(),
                "|_| |_|\\___/_/\\_\\___|_| |_|".blue().bold(),
            );
            println!(
                "   {} {}\n",
                "Multi-agent research orchestration".bright_white().bold(),
                format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
            );
        } else {
            println!(
                r#"
 _ __   _____  _____ _ __
| '_ \ / _ \ \/ / _ \ '_ \
| | | |  __/>  <  __/ | | |
|_| |_|\___/_/\_\___|_| |_|

   Multi-agent research orchestration v{}
"#,
                env!("CARGO_PKG_VERSION")
            );
        }
    }

    /// Print a success message with a checkmark
    pub fn success(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "✓".green().bold(), message.green());
        } else {
            println!("  [OK] {}", message);
        }
    }

    /// Print an info message
    pub fn info(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "•".blue(), message);
        } else {
            println!("  [INFO] {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "⚠".yellow().bold(), message.yellow());
        } else {
            println!("  [WARN] {}", message);
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.colored {
            eprintln!("  {} {}", "✗".red().bold(), message.red());
        } else {
            eprintln!("  [ERROR] {}", message);
        }
    }

    /// Print a file creation message
    pub fn created(&self, file_type: &str, path: &str) {
        if self.colored {
            println!(
                "  {} {} {}",
                "✓".green().bold(),
                file_type.dimmed(),
                path.bright_white()
            );
        } else {
            println!("  [CREATED] {} {}", file_type, path);
        }
    }

    /// Print a file skipped message
    pub fn skipped(&self, path: &str, reason: &str) {
        if self.colored {
            println!(
                "  {} {} {}",
                "○".yellow(),
                path.dimmed(),
                format!("({})", reason).yellow()
            );
        } else {
            println!("  [SKIPPED] {} ({})", path, reason);
        }
    }

    /// Print a directory creation message
    pub fn created_dir(&self, path: &str) {
        if self.colored {
            println!(
                "  {} {} {}",
                "✓".green().bold(),
                "directory".dimmed(),
                path.bright_white()
            );
        } else {
            println!("  [CREATED] directory {}", path);
        }
    }

    /// Print a header for a section
    pub fn header(&self, title: &str) {
        if self.colored {
            println!("\n  {}", title.bright_white().bold().underline());
        } else {
            println!("\n  === {} ===", title);
        }
    }

    /// Print a subheader
    pub fn subheader(&self, title: &str) {
        if self.colored {
            println!("\n  {}", title.cyan().bold());
        } else {
            println!("\n  --- {} ---", title);
        }
    }

    /// Print a key-value pair
    pub fn kv(&self, key: &str, value: &str) {
        if self.colored {
            println!("    {}: {}", key.dimmed(), value.bright_white());
        } else {
            println!("    {}: {}", key, value);
        }
    }

    /// Print a list item
    pub fn list_item(&self, item: &str) {
        if self.colored {
            println!("    {} {}", "•".blue(), item);
        } else {
            println!("    - {}", item);
        }
    }

    /// Print a hint/tip message
    pub fn hint(&self, message: &str) {
        if self.colored {
            println!("\n  {} {}", "💡".dimmed(), message.dimmed().italic());
        } else {
            println!("\n  [TIP] {}", message);
        }
    }

    /// Print a command suggestion
    pub fn command(&self, cmd: &str) {
        if self.colored {
            println!("     {}", format!("$ {}", cmd).bright_cyan());
        } else {
            println!("     $ {}", cmd);
        }
    }

    /// Print completion message
    pub fn complete(&self, message: &str) {
        if self.colored {
            println!("\n  {} {}", "🚀".green(), message.bright_green().bold());
        } else {
            println!("\n  [DONE] {}", message);
        }
    }

    /// Print a table header row
    pub fn table_header(&self, columns: &[&str]) {
        let header = table_line(columns);
        if self.colored {
            println!("    {}", header.bright_white().bold());
            println!("    {}", "─".repeat(columns.len() * 16).dimmed());
        } else {
            println!("    {}", header);
            println!("    {}", "-".repeat(columns.len() * 16));
        }
    }

    /// Print a table row
    pub fn table_row(&self, values: &[&str]) {
        println!("    {}", table_line(values));
    }

    /// Print one research event as a single line
    pub fn event(&self, event: &ResearchEvent) {
        let line = describe_event(&event.kind);
        let seq = format!("[{:>3}]", event.seq);
        if !self.colored {
            println!("  {} {}", seq, line);
            return;
        }
        let seq = seq.dimmed().to_string();
        match &event.kind {
            EventKind::TaskCompleted { .. } => println!("  {} {} {}", seq, "✓".green().bold(), line),
            EventKind::TaskFailed { .. } | EventKind::Error { .. } => {
                println!("  {} {} {}", seq, "✗".red().bold(), line.red())
            }
            EventKind::TaskProgress { .. } => println!("  {} {}", seq, line.dimmed()),
            EventKind::GroupStarted { .. } | EventKind::GroupCompleted { .. } => {
                println!("  {} {}", seq, line.cyan().bold())
            }
            EventKind::SessionCompleted { status, .. } if *status == SessionStatus::Completed => {
                println!("  {} {}", seq, line.bright_green().bold())
            }
            EventKind::SessionCompleted { .. } => println!("  {} {}", seq, line.red().bold()),
            _ => println!("  {} {}", seq, line.bright_white()),
        }
    }

    /// Print a block of markdown as-is, indented
    pub fn markdown(&self, text: &str) {
        for line in text.lines() {
            if self.colored && line.starts_with('#') {
                println!("  {}", line.bright_white().bold());
            } else {
                println!("  {}", line);
            }
        }
    }

    /// Print newline
    pub fn newline(&self) {
        println!();
    }
}

fn table_line(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("{:<15}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Plain one-line description of an event
pub fn describe_event(kind: &EventKind) -> String {
    match kind {
        EventKind::SessionStarted { max_agents, .. } => {
            format!("session started (up to {} agents)", max_agents)
        }
        EventKind::DecompositionComplete { tasks, groups, fallback, .. } => format!(
            "decomposed into {} task(s) across {} group(s){}",
            tasks,
            groups,
            if *fallback { " (fallback plan)" } else { "" }
        ),
        EventKind::GroupStarted { group, task_ids } => {
            format!("group {} started with {} task(s)", group + 1, task_ids.len())
        }
        EventKind::GroupCompleted { group, completed, failed, skipped } => format!(
            "group {} done: {} completed, {} failed, {} skipped",
            group + 1,
            completed,
            failed,
            skipped
        ),
        EventKind::TaskStarted { task_id, agent, attempt, model, .. } => {
            if *attempt > 1 {
                format!("{} [{}] retry {} on {}", agent, short_id(task_id), attempt - 1, model)
            } else {
                format!("{} [{}] started on {}", agent, short_id(task_id), model)
            }
        }
        EventKind::TaskProgress { task_id, agent, stage } => {
            format!("{} [{}] {}", agent, short_id(task_id), stage)
        }
        EventKind::TaskCompleted { task_id, agent, tokens_used, duration_ms, confidence, progress } => format!(
            "{} [{}] completed: {} tokens, {:.1}s, confidence {:.2} ({}%)",
            agent,
            short_id(task_id),
            tokens_used,
            *duration_ms as f64 / 1000.0,
            confidence,
            progress
        ),
        EventKind::TaskFailed { task_id, agent, error, retry_count, progress } => format!(
            "{} [{}] failed after {} retr{}: {} ({}%)",
            agent,
            short_id(task_id),
            retry_count,
            if *retry_count == 1 { "y" } else { "ies" },
            error,
            progress
        ),
        EventKind::SynthesisStarted { .. } => "synthesizing report".to_string(),
        EventKind::SynthesisComplete { tokens_used, fallback } => format!(
            "synthesis complete: {} tokens{}",
            tokens_used,
            if *fallback { " (fallback report)" } else { "" }
        ),
        EventKind::SessionCompleted { status, tokens_used, cost_micros, .. } => format!(
            "session {}: {} tokens, ${:.4}",
            status,
            tokens_used,
            *cost_micros as f64 / 1_000_000.0
        ),
        EventKind::Error { message, agent, .. } => match agent {
            Some(agent) => format!("error ({}): {}", agent, message),
            None => format!("error: {}", message),
        },
    }
}
