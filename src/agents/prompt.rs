//! Prompt stage: system prompt assembly and the optional
//! generate, review, refine loop.

use super::profile::AgentProfile;
use crate::llm::{CompletionRequest, LLMClient};
use std::fmt::Write as _;
use tracing::{debug, warn};

/// Highest score a reviewer can give
pub const MAX_REVIEW_SCORE: u8 = 50;

/// System prompt from persona, traits, responsibilities, data sources and skills
pub fn build_system_prompt(profile: &AgentProfile) -> String {
    let mut out = String::new();
    if profile.persona.trim().is_empty() {
        let _ = writeln!(out, "You are {}, a research agent.", profile.display_name);
    } else {
        let _ = writeln!(out, "{}", profile.persona.trim());
    }

    if !profile.traits.is_empty() {
        out.push_str("\n## Traits\n");
        for (name, level) in &profile.traits {
            let _ = writeln!(out, "- {}: {}", name, level);
        }
    }
    if !profile.responsibilities.is_empty() {
        out.push_str("\n## Responsibilities\n");
        for r in &profile.responsibilities {
            let _ = writeln!(out, "- {}", r);
        }
    }
    if !profile.data_sources.is_empty() {
        let _ = writeln!(out, "\n## Data Sources\n{}", profile.data_sources.join(", "));
    }
    if !profile.enabled_skills.is_empty() {
        let _ = writeln!(out, "\n## Skills\n{}", profile.enabled_skills.join(", "));
    }

    out.push_str(
        "\n## Output Format\n\
         Answer in markdown with the sections `## Key Findings`, `## Uncertainties`, \
         `## Suggestions` and `## References`, using bullet points.\n",
    );
    out
}

/// Task prompt for one research task
pub fn build_task_prompt(task: &str, session_task: &str) -> String {
    if session_task.trim().is_empty() || session_task.trim() == task.trim() {
        format!("## Task\n{}\n", task.trim())
    } else {
        format!(
            "## Research Goal\n{}\n\n## Your Task\n{}\n",
            session_task.trim(),
            task.trim()
        )
    }
}

/// Result of the prompt stage
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedPrompt {
    pub prompt: String,
    /// Review score of the chosen draft, if any review succeeded
    pub score: Option<u8>,
    pub iterations: u8,
    pub tokens_used: u64,
}

impl RefinedPrompt {
    fn unrefined(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            score: None,
            iterations: 0,
            tokens_used: 0,
        }
    }
}

/// First integer after `SCORE:`, clamped to 0..=50; 0 when absent
pub fn parse_review_score(review: &str) -> u8 {
    let upper = review.to_ascii_uppercase();
    let Some(pos) = upper.find("SCORE") else {
        return 0;
    };
    let digits: String = review[pos + "SCORE".len()..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<u64>()
        .map(|n| n.min(MAX_REVIEW_SCORE as u64) as u8)
        .unwrap_or(0)
}

/// Run the refinement loop when the profile enables it.
///
/// Model errors never fail the stage: the best draft so far (or the
/// original prompt) is used instead.
pub async fn refine_prompt(llm: &dyn LLMClient, profile: &AgentProfile, prompt: &str) -> RefinedPrompt {
    let stage = &profile.pipeline.prompt;
    if !stage.enabled || stage.max_iterations == 0 {
        return RefinedPrompt::unrefined(prompt);
    }

    let mut result = RefinedPrompt::unrefined(prompt);
    let generate = CompletionRequest::new(
        stage.generator_model.clone(),
        format!(
            "Rewrite the following research task prompt so it is specific, \
             self-contained and asks for structured findings. \
             Return only the prompt.\n\n{}",
            prompt
        ),
    )
    .with_system(build_system_prompt(profile))
    .with_temperature(0.7)
    .with_max_tokens(1000);

    let mut draft = match llm.complete(&generate).await {
        Ok(c) => {
            result.tokens_used += c.tokens_used;
            c.content.trim().to_string()
        }
        Err(e) => {
            warn!(agent = %profile.agent_type, error = %e, "prompt generation failed, using original prompt");
            return result;
        }
    };
    if draft.is_empty() {
        draft = prompt.to_string();
    }

    let mut best: Option<(u8, String)> = None;
    for iteration in 1..=stage.max_iterations {
        result.iterations = iteration;
        let review = CompletionRequest::new(
            stage.reviewer().to_string(),
            format!(
                "Review this task prompt for clarity, specificity and completeness. \
                 Reply with `SCORE: <0-50>` on the first line, then feedback.\n\n{}",
                draft
            ),
        )
        .with_temperature(0.2)
        .with_max_tokens(500);

        let feedback = match llm.complete(&review).await {
            Ok(c) => {
                result.tokens_used += c.tokens_used;
                c.content
            }
            Err(e) => {
                warn!(agent = %profile.agent_type, iteration, error = %e, "prompt review failed");
                break;
            }
        };
        let score = parse_review_score(&feedback);
        debug!(agent = %profile.agent_type, iteration, score, "prompt reviewed");

        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, draft.clone()));
        }
        if score >= stage.pass_threshold || iteration == stage.max_iterations {
            break;
        }

        let refine = CompletionRequest::new(
            stage.refiner().to_string(),
            format!(
                "Improve the task prompt using the reviewer feedback. \
                 Return only the improved prompt.\n\n## Prompt\n{}\n\n## Feedback\n{}",
                draft, feedback
            ),
        )
        .with_temperature(0.5)
        .with_max_tokens(1000);

        match llm.complete(&refine).await {
            Ok(c) => {
                result.tokens_used += c.tokens_used;
                let refined = c.content.trim();
                if !refined.is_empty() {
                    draft = refined.to_string();
                }
            }
            Err(e) => {
                warn!(agent = %profile.agent_type, iteration, error = %e, "prompt refinement failed");
                break;
            }
        }
    }

    match best {
        Some((score, text)) => {
            result.prompt = text;
            result.score = Some(score);
        }
        None => result.prompt = draft,
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::profile::{Cluster, NewProfile, TraitLevel};
    use crate::llm::Completion;
    use crate::types::{AppError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LLMClient for Scripted {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            *self.calls.lock() += 1;
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::LLM("script exhausted".into())))?;
            Ok(Completion::estimated(request, reply))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn profile(enabled: bool) -> AgentProfile {
        let mut input = NewProfile::new("critic", "Critic", Cluster::Reasoning, "openai/gpt-4o");
        input.persona = "You are a critic.".into();
        input.traits.insert("rigor".into(), TraitLevel::VeryHigh);
        input.responsibilities = vec!["Find flaws".into()];
        input.data_sources = vec!["arxiv".into()];
        input.enabled_skills = vec!["/review".into()];
        let mut p = input.into_profile("u", false).unwrap();
        p.pipeline.prompt.enabled = enabled;
        p
    }

    #[test]
    fn test_system_prompt_sections() {
        let prompt = build_system_prompt(&profile(false));
        assert!(prompt.starts_with("You are a critic."));
        assert!(prompt.contains("- rigor: very_high"));
        assert!(prompt.contains("- Find flaws"));
        assert!(prompt.contains("## Data Sources\narxiv"));
        assert!(prompt.contains("## Skills\n/review"));
    }

    #[test]
    fn test_parse_review_score() {
        assert_eq!(parse_review_score("SCORE: 42\nlooks good"), 42);
        assert_eq!(parse_review_score("score:7"), 7);
        assert_eq!(parse_review_score("SCORE: 99"), 50);
        assert_eq!(parse_review_score("no score here"), 0);
        assert_eq!(parse_review_score(""), 0);
    }

    #[tokio::test]
    async fn test_disabled_loop_returns_original() {
        let llm = Scripted::new(vec![]);
        let refined = refine_prompt(&llm, &profile(false), "task").await;
        assert_eq!(refined.prompt, "task");
        assert_eq!(*llm.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_stops_early_when_threshold_met() {
        let llm = Scripted::new(vec![Ok("draft one".into()), Ok("SCORE: 45".into())]);
        let refined = refine_prompt(&llm, &profile(true), "task").await;
        assert_eq!(refined.prompt, "draft one");
        assert_eq!(refined.score, Some(45));
        assert_eq!(refined.iterations, 1);
        assert_eq!(*llm.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_uses_best_draft_when_none_pass() {
        let llm = Scripted::new(vec![
            Ok("draft one".into()),
            Ok("SCORE: 30".into()),
            Ok("draft two".into()),
            Ok("SCORE: 10".into()),
            Ok("draft three".into()),
            Ok("SCORE: 20".into()),
        ]);
        let refined = refine_prompt(&llm, &profile(true), "task").await;
        assert_eq!(refined.prompt, "draft one");
        assert_eq!(refined.score, Some(30));
        assert_eq!(refined.iterations, 3);
    }

    #[tokio::test]
    async fn test_generation_error_degrades_to_original() {
        let llm = Scripted::new(vec![Err(AppError::LLM("down".into()))]);
        let refined = refine_prompt(&llm, &profile(true), "task").await;
        assert_eq!(refined.prompt, "task");
        assert_eq!(refined.score, None);
    }

    #[tokio::test]
    async fn test_review_error_keeps_best_so_far() {
        let llm = Scripted::new(vec![
            Ok("draft one".into()),
            Ok("SCORE: 12".into()),
            Ok("draft two".into()),
            Err(AppError::LLM("down".into())),
        ]);
        let refined = refine_prompt(&llm, &profile(true), "task").await;
        assert_eq!(refined.prompt, "draft one");
        assert_eq!(refined.score, Some(12));
    }
}
