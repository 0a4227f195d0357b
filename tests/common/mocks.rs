//! Mock implementations for testing.
//!
//! [`ScriptedLLM`] answers completion requests from an ordered list of
//! rules, so one client can play decomposer, agents and synthesizer in the
//! same run. Every request is logged, and the number of calls in flight is
//! tracked for concurrency assertions.

use async_trait::async_trait;
use nexen::llm::{Completion, CompletionRequest, LLMClient};
use nexen::types::{AppError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a matching rule does
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Sleep, then answer
    Slow(Duration, String),
    /// Never answer
    Hang,
}

#[derive(Debug, Clone)]
struct Rule {
    model: Option<String>,
    needle: Option<String>,
    reply: Reply,
}

impl Rule {
    fn matches(&self, request: &CompletionRequest) -> bool {
        if let Some(model) = &self.model {
            if &request.model != model {
                return false;
            }
        }
        match &self.needle {
            Some(needle) => {
                request.prompt.contains(needle.as_str())
                    || request
                        .system
                        .as_deref()
                        .map(|s| s.contains(needle.as_str()))
                        .unwrap_or(false)
            }
            None => true,
        }
    }
}

/// Marker present in every decomposition system prompt
pub const DECOMPOSER_MARKER: &str = "task decomposition expert";
/// Marker present in every synthesis prompt
pub const SYNTHESIS_MARKER: &str = "Write the final research report";

/// Agent answer with findings and an open question
pub const AGENT_ANSWER: &str = "## Key Findings\n\
    - State-space models scale linearly with sequence length\n\
    - Attention cost grows quadratically with context\n\
    ## Uncertainties\n\
    - Recall on very long contexts\n";

pub const REPORT: &str = "## Overview\nok\n## Key Findings\n- x\n## Key Insights\n- y\n\
    ## Conclusions & Recommendations\n- z\n";

/// Rule-driven LLM client; the first matching rule wins
pub struct ScriptedLLM {
    rules: Mutex<Vec<Rule>>,
    fallback: Reply,
    calls: Mutex<Vec<CompletionRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLLM {
    /// Answer every unmatched request with `text`
    pub fn new(text: &str) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fallback: Reply::Text(text.to_string()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Decomposer answers `plan`, synthesis answers [`REPORT`], agents answer [`AGENT_ANSWER`]
    pub fn research(plan: &str) -> Self {
        Self::new(AGENT_ANSWER)
            .on(DECOMPOSER_MARKER, Reply::Text(plan.to_string()))
            .on(SYNTHESIS_MARKER, Reply::Text(REPORT.to_string()))
    }

    /// Requests whose prompt or system prompt contains `needle`
    pub fn on(self, needle: &str, reply: Reply) -> Self {
        self.rules.lock().push(Rule {
            model: None,
            needle: Some(needle.to_string()),
            reply,
        });
        self
    }

    /// Requests for `model` containing `needle`
    pub fn on_model(self, model: &str, needle: &str, reply: Reply) -> Self {
        self.rules.lock().push(Rule {
            model: Some(model.to_string()),
            needle: Some(needle.to_string()),
            reply,
        });
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().clone()
    }

    /// Calls whose prompt or system prompt contains `needle`
    pub fn calls_matching(&self, needle: &str) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|r| {
                r.prompt.contains(needle)
                    || r.system.as_deref().map(|s| s.contains(needle)).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Most calls ever in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &CompletionRequest) -> Reply {
        self.rules
            .lock()
            .iter()
            .find(|r| r.matches(request))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LLMClient for ScriptedLLM {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.reply_for(request) {
            Reply::Text(text) => Ok(Completion::estimated(request, text)),
            Reply::Fail(message) => Err(AppError::LLM(message)),
            Reply::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(Completion::estimated(request, text))
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(AppError::Internal("unreachable".to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let llm = ScriptedLLM::new("default")
            .on_model("m1", "hello", Reply::Fail("boom".into()))
            .on("hello", Reply::Text("hi".into()));

        assert!(llm.complete(&CompletionRequest::new("m1", "hello")).await.is_err());
        let c = llm.complete(&CompletionRequest::new("m2", "hello")).await.unwrap();
        assert_eq!(c.content, "hi");
        let c = llm.complete(&CompletionRequest::new("m2", "other")).await.unwrap();
        assert_eq!(c.content, "default");
        assert_eq!(llm.calls().len(), 3);
        assert_eq!(llm.peak_in_flight(), 1);
    }
}
