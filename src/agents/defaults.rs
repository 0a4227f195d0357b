//! The fourteen built-in agent templates.

use super::profile::{Cluster, NewProfile, TraitLevel};
use std::collections::BTreeMap;
use TraitLevel::{High, Low, VeryHigh};

const PRIMARY_MODEL: &str = "openai/gpt-4o";
const FALLBACK_MODEL: &str = "google/gemini-2.0-pro";

/// Static description of a default agent
#[derive(Debug, Clone, Copy)]
pub struct AgentTemplate {
    pub agent_type: &'static str,
    pub display_name: &'static str,
    pub cluster: Cluster,
    pub role_model: &'static str,
    pub fallback_model: &'static str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub persona: &'static str,
    pub traits: &'static [(&'static str, TraitLevel)],
    pub responsibilities: &'static [&'static str],
    pub data_sources: &'static [&'static str],
    pub skills: &'static [&'static str],
    /// One-line capability summary shown to the decomposer
    pub capability: &'static str,
}

impl AgentTemplate {
    pub fn to_new_profile(&self) -> NewProfile {
        let mut profile = NewProfile::new(
            self.agent_type,
            self.display_name,
            self.cluster,
            self.role_model,
        );
        profile.fallback_model = Some(self.fallback_model.to_string());
        profile.temperature = self.temperature;
        profile.max_tokens = self.max_tokens;
        profile.persona = self.persona.to_string();
        profile.traits = self
            .traits
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<BTreeMap<_, _>>();
        profile.responsibilities = self.responsibilities.iter().map(|s| s.to_string()).collect();
        profile.data_sources = self.data_sources.iter().map(|s| s.to_string()).collect();
        profile.enabled_skills = self.skills.iter().map(|s| s.to_string()).collect();
        profile
    }
}

pub static DEFAULT_AGENTS: [AgentTemplate; 14] = [
    AgentTemplate {
        agent_type: "meta_coordinator",
        display_name: "Meta-Coordinator",
        cluster: Cluster::Coordination,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.7,
        max_tokens: 4000,
        persona: "You are a senior AI research PI who breaks down tasks, coordinates agents and integrates their output.",
        traits: &[("leadership", VeryHigh), ("decision_making", VeryHigh)],
        responsibilities: &[
            "Decompose complex research tasks",
            "Assign tasks to suitable agents",
            "Integrate agent outputs",
            "Make final decisions",
        ],
        data_sources: &[],
        skills: &[],
        capability: "planning, coordination, integrating results",
    },
    AgentTemplate {
        agent_type: "logician",
        display_name: "Logician",
        cluster: Cluster::Reasoning,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.1,
        max_tokens: 4000,
        persona: "You are a rigorous logical reasoning expert, skilled at mathematical proof and formal verification.",
        traits: &[("rigor", VeryHigh), ("creativity", Low), ("formalization", VeryHigh)],
        responsibilities: &[
            "Logical reasoning and mathematical proof",
            "Formal verification",
            "Complexity analysis",
            "Theoretical correctness review",
        ],
        data_sources: &[],
        skills: &[],
        capability: "logic, proofs, formal verification, complexity analysis",
    },
    AgentTemplate {
        agent_type: "critic",
        display_name: "Critic",
        cluster: Cluster::Reasoning,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.3,
        max_tokens: 4000,
        persona: "You are a demanding academic critic who finds methodological flaws and offers constructive feedback.",
        traits: &[("critical_thinking", VeryHigh), ("constructiveness", High)],
        responsibilities: &[
            "Method review and critique",
            "Challenge assumptions",
            "Construct counterexamples",
            "Review experiment design",
        ],
        data_sources: &[],
        skills: &[],
        capability: "critique, peer review, finding flaws and counterexamples",
    },
    AgentTemplate {
        agent_type: "connector",
        display_name: "Connector",
        cluster: Cluster::Reasoning,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.7,
        max_tokens: 4000,
        persona: "You are a cross-domain knowledge connector who uncovers deep links between different fields.",
        traits: &[("creativity", VeryHigh), ("cross_domain", VeryHigh)],
        responsibilities: &[
            "Discover cross-domain connections",
            "Analogical reasoning",
            "Synthesize ideas",
            "Identify novel contributions",
        ],
        data_sources: &[],
        skills: &[],
        capability: "cross-domain connections, analogies, idea fusion",
    },
    AgentTemplate {
        agent_type: "genealogist",
        display_name: "Genealogist",
        cluster: Cluster::Reasoning,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 4000,
        persona: "You are an academic genealogist who builds researcher profiles and traces advisor lineages.",
        traits: &[("research_depth", VeryHigh), ("people_focus", VeryHigh)],
        responsibilities: &[
            "Build researcher profiles",
            "Trace academic lineage",
            "Analyze the evolution of ideas",
            "Identify schools of thought",
        ],
        data_sources: &["google_scholar", "semantic_scholar"],
        skills: &["/who", "/lineage", "/thought-evolution"],
        capability: "who's who, researcher profiles, academic lineage",
    },
    AgentTemplate {
        agent_type: "historian",
        display_name: "Historian",
        cluster: Cluster::Reasoning,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 4000,
        persona: "You are a historian of technology who charts how techniques evolved and identifies milestones.",
        traits: &[("historical_perspective", VeryHigh), ("pattern_recognition", High)],
        responsibilities: &[
            "Trace technical origins",
            "Identify milestones",
            "Identify axes of evolution",
            "Forecast trends",
        ],
        data_sources: &["arxiv", "semantic_scholar"],
        skills: &["/tech-origin", "/timeline", "/evolution", "/predict-next"],
        capability: "history, timelines, evolution of techniques, milestones",
    },
    AgentTemplate {
        agent_type: "explorer",
        display_name: "Explorer",
        cluster: Cluster::Information,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.7,
        max_tokens: 4000,
        persona: "You are a curious research explorer, skilled at literature search and spotting trends.",
        traits: &[("curiosity", VeryHigh), ("breadth", High)],
        responsibilities: &[
            "Literature search and screening",
            "Discover new directions",
            "Propose hypotheses",
            "Track research trends",
        ],
        data_sources: &["arxiv", "semantic_scholar", "google_scholar"],
        skills: &["/survey", "/paper-deep-dive", "/trend"],
        capability: "literature search, surveys, papers, research trends",
    },
    AgentTemplate {
        agent_type: "social_scout",
        display_name: "Social Scout",
        cluster: Cluster::Information,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.6,
        max_tokens: 4000,
        persona: "You are an intelligence specialist for the AI research community, tracking research chatter on social media.",
        traits: &[("social_awareness", VeryHigh), ("timeliness", High)],
        responsibilities: &[
            "Monitor social media",
            "Track hot topics",
            "Analyze community sentiment",
            "Gather informal information",
        ],
        data_sources: &["twitter", "reddit", "hacker_news"],
        skills: &[],
        capability: "social media, community discussion, hot topics",
    },
    AgentTemplate {
        agent_type: "cn_specialist",
        display_name: "CN Specialist",
        cluster: Cluster::Information,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 4000,
        persona: "You are an expert in Chinese-language academic resources, skilled at Chinese literature search and terminology translation.",
        traits: &[("chinese_proficiency", VeryHigh), ("bilingual", VeryHigh)],
        responsibilities: &[
            "Chinese literature search",
            "Chinese community analysis",
            "Terminology translation",
            "Understand the domestic ecosystem",
        ],
        data_sources: &["cnki", "wanfang", "zhihu"],
        skills: &[],
        capability: "Chinese-language literature and communities, translation",
    },
    AgentTemplate {
        agent_type: "vision_analyst",
        display_name: "Vision Analyst",
        cluster: Cluster::Information,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 4000,
        persona: "You are a multimodal research analyst, skilled at reading figures and architecture diagrams in papers.",
        traits: &[("visual_analysis", VeryHigh), ("detail_oriented", High)],
        responsibilities: &[
            "Chart analysis",
            "Architecture diagram interpretation",
            "Visual comparison",
            "Multimodal understanding",
        ],
        data_sources: &[],
        skills: &[],
        capability: "figures, charts, architecture diagrams, visual comparison",
    },
    AgentTemplate {
        agent_type: "builder",
        display_name: "Builder",
        cluster: Cluster::Production,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.3,
        max_tokens: 8000,
        persona: "You are a senior ML engineering researcher who turns ideas into runnable code.",
        traits: &[("coding", VeryHigh), ("engineering", VeryHigh)],
        responsibilities: &[
            "Code implementation",
            "Experiment design",
            "Prototyping",
            "Performance optimization",
        ],
        data_sources: &["github", "huggingface"],
        skills: &["/replicate", "/ablation", "/benchmark"],
        capability: "code, implementation, experiments, benchmarks",
    },
    AgentTemplate {
        agent_type: "scribe",
        display_name: "Scribe",
        cluster: Cluster::Production,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 8000,
        persona: "You are an excellent academic writer who distills complex discussions into a clear structure.",
        traits: &[("writing", VeryHigh), ("organization", VeryHigh)],
        responsibilities: &[
            "Paper writing",
            "Documentation",
            "Report generation",
            "Knowledge structuring",
        ],
        data_sources: &[],
        skills: &["/draft", "/rebuttal", "/slides", "/blog"],
        capability: "writing, reports, documentation, structuring knowledge",
    },
    AgentTemplate {
        agent_type: "archivist",
        display_name: "Archivist",
        cluster: Cluster::Production,
        role_model: "openai/gpt-4o-mini",
        fallback_model: "google/gemini-2.0-flash",
        temperature: 0.3,
        max_tokens: 4000,
        persona: "You are the research archivist, responsible for organizing and distilling the information produced during research.",
        traits: &[("organization", VeryHigh), ("summarization", High)],
        responsibilities: &[
            "Memory management",
            "Summary generation",
            "Knowledge indexing",
            "Contradiction detection",
        ],
        data_sources: &[],
        skills: &[],
        capability: "memory management, summaries, contradiction detection",
    },
    AgentTemplate {
        agent_type: "prompt_engineer",
        display_name: "Prompt Engineer",
        cluster: Cluster::Production,
        role_model: PRIMARY_MODEL,
        fallback_model: FALLBACK_MODEL,
        temperature: 0.5,
        max_tokens: 4000,
        persona: "You are a professional AI prompt engineer, skilled at designing high-quality system prompts.",
        traits: &[("prompt_design", VeryHigh), ("creativity", High)],
        responsibilities: &[
            "System prompt design",
            "Agent persona tuning",
            "Task prompt generation",
            "Prompt review",
        ],
        data_sources: &[],
        skills: &[],
        capability: "prompt design and review",
    },
];

/// Look up a built-in template
pub fn template(agent_type: &str) -> Option<&'static AgentTemplate> {
    DEFAULT_AGENTS.iter().find(|t| t.agent_type == agent_type)
}

/// Capability summary for any agent type; custom agents fall back to
/// their responsibilities
pub fn capability_of(agent_type: &str) -> Option<&'static str> {
    template(agent_type).map(|t| t.capability)
}

/// Keyword rules, checked in order
const ASSIGNMENT_RULES: &[(&[&str], &str)] = &[
    (&["literature", "paper", "survey"], "explorer"),
    (&["who", "lineage"], "genealogist"),
    (&["timeline", "evolution", "history"], "historian"),
    (&["proof", "logic"], "logician"),
    (&["critique", "review"], "critic"),
    (&["cross", "connect"], "connector"),
    (&["code", "implement"], "builder"),
    (&["write", "report"], "scribe"),
    (&["social"], "social_scout"),
    (&["chinese"], "cn_specialist"),
    (&["visual", "chart"], "vision_analyst"),
];

/// Pick a default agent for a task from keywords in its description.
///
/// `who` matches only as a whole word; the other keywords match as
/// substrings so `papers` and `implementation` count.
pub fn assign_agent_for_task(description: &str) -> &'static str {
    let lower = description.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for (keywords, agent) in ASSIGNMENT_RULES {
        let hit = keywords.iter().any(|k| {
            if *k == "who" {
                words.contains(k)
            } else {
                lower.contains(k)
            }
        });
        if hit {
            return agent;
        }
    }
    "explorer"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fourteen_unique_valid_templates() {
        let types: HashSet<_> = DEFAULT_AGENTS.iter().map(|t| t.agent_type).collect();
        assert_eq!(types.len(), 14);
        for template in DEFAULT_AGENTS.iter() {
            template
                .to_new_profile()
                .into_profile("owner", false)
                .unwrap_or_else(|e| panic!("{} invalid: {e}", template.agent_type));
        }
    }

    #[test]
    fn test_template_values() {
        let logician = template("logician").unwrap();
        assert_eq!(logician.temperature, 0.1);
        assert_eq!(logician.cluster, Cluster::Reasoning);

        let archivist = template("archivist").unwrap();
        assert_eq!(archivist.role_model, "openai/gpt-4o-mini");
        assert_eq!(archivist.fallback_model, "google/gemini-2.0-flash");

        assert_eq!(template("builder").unwrap().max_tokens, 8000);
        assert_eq!(template("scribe").unwrap().max_tokens, 8000);
        assert_eq!(template("explorer").unwrap().skills, &["/survey", "/paper-deep-dive", "/trend"]);

        let clusters: HashSet<_> = DEFAULT_AGENTS.iter().map(|t| t.cluster).collect();
        assert_eq!(clusters.len(), 4);
    }

    #[test]
    fn test_assign_agent_for_task() {
        assert_eq!(assign_agent_for_task("Survey recent papers on Mamba"), "explorer");
        assert_eq!(assign_agent_for_task("Who trained Hinton's students?"), "genealogist");
        assert_eq!(assign_agent_for_task("Timeline of attention"), "historian");
        assert_eq!(assign_agent_for_task("Check the proof"), "logician");
        assert_eq!(assign_agent_for_task("Critique the method"), "critic");
        assert_eq!(assign_agent_for_task("Connect RL and control"), "connector");
        assert_eq!(assign_agent_for_task("Implement a baseline"), "builder");
        assert_eq!(assign_agent_for_task("Write a summary"), "scribe");
        assert_eq!(assign_agent_for_task("Social buzz on LLMs"), "social_scout");
        assert_eq!(assign_agent_for_task("Chinese community view"), "cn_specialist");
        assert_eq!(assign_agent_for_task("Analyze the chart"), "vision_analyst");
        assert_eq!(assign_agent_for_task("Compare transformers and SSMs"), "explorer");
        // "whole" must not trigger the genealogist rule
        assert_eq!(assign_agent_for_task("the whole picture"), "explorer");
    }
}
