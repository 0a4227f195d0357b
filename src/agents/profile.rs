//! Agent profile model and validation.

use crate::memory::RetrievalRequest;
use crate::types::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Agent cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cluster {
    Coordination,
    Reasoning,
    Information,
    Production,
}

impl Cluster {
    pub const ALL: [Cluster; 4] = [
        Cluster::Coordination,
        Cluster::Reasoning,
        Cluster::Information,
        Cluster::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cluster::Coordination => "coordination",
            Cluster::Reasoning => "reasoning",
            Cluster::Information => "information",
            Cluster::Production => "production",
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cluster {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Cluster::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "unknown cluster '{}' (expected coordination, reasoning, information or production)",
                    s
                ))
            })
    }
}

/// Ordinal trait level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl TraitLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraitLevel::VeryLow => "very_low",
            TraitLevel::Low => "low",
            TraitLevel::Medium => "medium",
            TraitLevel::High => "high",
            TraitLevel::VeryHigh => "very_high",
        }
    }
}

impl fmt::Display for TraitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraitLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "very_low" => Ok(TraitLevel::VeryLow),
            "low" => Ok(TraitLevel::Low),
            "medium" => Ok(TraitLevel::Medium),
            "high" => Ok(TraitLevel::High),
            "very_high" => Ok(TraitLevel::VeryHigh),
            other => Err(AppError::InvalidInput(format!(
                "unknown trait level '{}' (expected very_low, low, medium, high or very_high)",
                other
            ))),
        }
    }
}

/// Prompt stage: optional generate, review, refine loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptStageConfig {
    pub enabled: bool,
    pub generator_model: String,
    /// Defaults to the generator model
    pub reviewer_model: Option<String>,
    /// Defaults to the generator model
    pub refiner_model: Option<String>,
    /// Review score (0-50) at which a draft is accepted
    pub pass_threshold: u8,
    pub max_iterations: u8,
}

impl Default for PromptStageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            generator_model: "openai/gpt-4o".to_string(),
            reviewer_model: None,
            refiner_model: None,
            pass_threshold: 40,
            max_iterations: 3,
        }
    }
}

impl PromptStageConfig {
    pub fn reviewer(&self) -> &str {
        self.reviewer_model.as_deref().unwrap_or(&self.generator_model)
    }

    pub fn refiner(&self) -> &str {
        self.refiner_model.as_deref().unwrap_or(&self.generator_model)
    }
}

/// Memory stage: what to retrieve and how much
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStageConfig {
    pub token_budget: usize,
    pub semantic_search: bool,
    pub semantic_top_k: usize,
    /// Insight files loaded first
    pub default_insights: Vec<String>,
    /// `None` makes every other agent's digest eligible
    pub eligible_digests: Option<Vec<String>>,
}

impl Default for MemoryStageConfig {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            semantic_search: true,
            semantic_top_k: 5,
            default_insights: vec![crate::memory::KEY_FINDINGS.to_string()],
            eligible_digests: None,
        }
    }
}

/// Local cleanup applied to retrieved context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTask {
    Deduplication,
    NoiseReduction,
    ImportanceRanking,
}

impl CleanupTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupTask::Deduplication => "deduplication",
            CleanupTask::NoiseReduction => "noise_reduction",
            CleanupTask::ImportanceRanking => "importance_ranking",
        }
    }
}

impl FromStr for CleanupTask {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().replace('-', "_").as_str() {
            "deduplication" => Ok(CleanupTask::Deduplication),
            "noise_reduction" => Ok(CleanupTask::NoiseReduction),
            "importance_ranking" => Ok(CleanupTask::ImportanceRanking),
            other => Err(AppError::InvalidInput(format!(
                "unknown cleanup task '{}'",
                other
            ))),
        }
    }
}

/// Preprocessing stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub tasks: Vec<CleanupTask>,
    pub temperature: f32,
    /// Ceiling for the cleaned context, in tokens
    pub max_output_tokens: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            tasks: vec![CleanupTask::Deduplication, CleanupTask::ImportanceRanking],
            temperature: 0.3,
            max_output_tokens: 2000,
        }
    }
}

/// Three-stage execution pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub prompt: PromptStageConfig,
    pub memory: MemoryStageConfig,
    pub preprocessing: PreprocessingConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prompt.pass_threshold > 50 {
            return Err(AppError::InvalidInput(format!(
                "pass_threshold must be 0-50, got {}",
                self.prompt.pass_threshold
            )));
        }
        if self.prompt.max_iterations > 3 {
            return Err(AppError::InvalidInput(format!(
                "max_iterations must be at most 3, got {}",
                self.prompt.max_iterations
            )));
        }
        if self.prompt.generator_model.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "generator_model must not be empty".to_string(),
            ));
        }
        if self.memory.token_budget == 0 {
            return Err(AppError::InvalidInput(
                "token_budget must be greater than 0".to_string(),
            ));
        }
        for (i, task) in self.preprocessing.tasks.iter().enumerate() {
            if self.preprocessing.tasks[..i].contains(task) {
                return Err(AppError::InvalidInput(format!(
                    "cleanup task '{}' listed twice",
                    task.as_str()
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.preprocessing.temperature) {
            return Err(AppError::InvalidInput(format!(
                "preprocessing temperature must be 0.0-2.0, got {}",
                self.preprocessing.temperature
            )));
        }
        Ok(())
    }
}

/// Configuration for one research persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub owner_id: String,
    pub agent_type: String,
    pub display_name: String,
    pub cluster: Cluster,
    pub role_model: String,
    pub fallback_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub persona: String,
    pub traits: BTreeMap<String, TraitLevel>,
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub data_sources: Vec<String>,
    pub enabled_skills: Vec<String>,
    pub is_enabled: bool,
    pub is_custom: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn validate(&self) -> Result<()> {
        validate_agent_type(&self.agent_type)?;
        validate_display_name(&self.display_name)?;
        validate_temperature(self.temperature)?;
        validate_max_tokens(self.max_tokens)?;
        if self.role_model.trim().is_empty() {
            return Err(AppError::InvalidInput("role_model must not be empty".to_string()));
        }
        for key in self.traits.keys() {
            validate_trait_key(key)?;
        }
        self.pipeline.validate()
    }

    /// Retrieval parameters from the memory stage
    pub fn retrieval_request(&self, session_id: &str, query: &str) -> RetrievalRequest {
        let memory = &self.pipeline.memory;
        let defaults = memory
            .default_insights
            .iter()
            .map(|k| k.trim_end_matches(".md").to_string())
            .collect();
        let mut request = RetrievalRequest::new(session_id, &self.agent_type, query, memory.token_budget)
            .with_default_insights(defaults)
            .with_semantic_search(memory.semantic_search, Some(memory.semantic_top_k));
        if let Some(agents) = &memory.eligible_digests {
            request = request.with_eligible_digests(agents.clone());
        }
        request
    }
}

/// Input for creating a custom profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProfile {
    pub agent_type: String,
    pub display_name: String,
    pub cluster: Cluster,
    pub role_model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub traits: BTreeMap<String, TraitLevel>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub enabled_skills: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

impl NewProfile {
    pub fn new(
        agent_type: impl Into<String>,
        display_name: impl Into<String>,
        cluster: Cluster,
        role_model: impl Into<String>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            display_name: display_name.into(),
            cluster,
            role_model: role_model.into(),
            fallback_model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            persona: String::new(),
            traits: BTreeMap::new(),
            responsibilities: Vec::new(),
            pipeline: None,
            data_sources: Vec::new(),
            enabled_skills: Vec::new(),
        }
    }

    pub(crate) fn into_profile(self, owner_id: &str, is_custom: bool) -> Result<AgentProfile> {
        let now = Utc::now();
        let profile = AgentProfile {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            agent_type: self.agent_type,
            display_name: self.display_name,
            cluster: self.cluster,
            role_model: self.role_model,
            fallback_model: self.fallback_model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            persona: self.persona,
            traits: self.traits,
            responsibilities: self.responsibilities,
            pipeline: self.pipeline.unwrap_or_default(),
            data_sources: self.data_sources,
            enabled_skills: self.enabled_skills,
            is_enabled: true,
            is_custom,
            created_at: now,
            updated_at: now,
        };
        profile.validate()?;
        Ok(profile)
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub role_model: Option<String>,
    pub fallback_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub persona: Option<String>,
    pub traits: Option<BTreeMap<String, TraitLevel>>,
    pub responsibilities: Option<Vec<String>>,
    pub pipeline: Option<PipelineConfig>,
    pub data_sources: Option<Vec<String>>,
    pub enabled_skills: Option<Vec<String>>,
    pub is_enabled: Option<bool>,
}

impl ProfileUpdate {
    /// Apply to a copy of `profile` and validate the result
    pub fn apply(self, profile: &AgentProfile) -> Result<AgentProfile> {
        let mut updated = profile.clone();
        if let Some(v) = self.display_name {
            updated.display_name = v;
        }
        if let Some(v) = self.role_model {
            updated.role_model = v;
        }
        if let Some(v) = self.fallback_model {
            updated.fallback_model = Some(v);
        }
        if let Some(v) = self.temperature {
            updated.temperature = v;
        }
        if let Some(v) = self.max_tokens {
            updated.max_tokens = v;
        }
        if let Some(v) = self.persona {
            updated.persona = v;
        }
        if let Some(v) = self.traits {
            updated.traits = v;
        }
        if let Some(v) = self.responsibilities {
            updated.responsibilities = v;
        }
        if let Some(v) = self.pipeline {
            updated.pipeline = v;
        }
        if let Some(v) = self.data_sources {
            updated.data_sources = v;
        }
        if let Some(v) = self.enabled_skills {
            updated.enabled_skills = v;
        }
        if let Some(v) = self.is_enabled {
            updated.is_enabled = v;
        }
        updated.validate()?;
        updated.updated_at = Utc::now();
        Ok(updated)
    }
}

pub fn validate_agent_type(agent_type: &str) -> Result<()> {
    let len = agent_type.chars().count();
    if !(1..=50).contains(&len) {
        return Err(AppError::InvalidInput(format!(
            "agent_type must be 1-50 characters, got {}",
            len
        )));
    }
    if !agent_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(AppError::InvalidInput(format!(
            "agent_type '{}' may only contain a-z, 0-9 and '_'",
            agent_type
        )));
    }
    Ok(())
}

fn validate_display_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(1..=100).contains(&len) {
        return Err(AppError::InvalidInput(format!(
            "display_name must be 1-100 characters, got {}",
            len
        )));
    }
    Ok(())
}

fn validate_temperature(temperature: f32) -> Result<()> {
    if !(0.0..=2.0).contains(&temperature) {
        return Err(AppError::InvalidInput(format!(
            "temperature must be 0.0-2.0, got {}",
            temperature
        )));
    }
    Ok(())
}

fn validate_max_tokens(max_tokens: u32) -> Result<()> {
    if !(100..=32000).contains(&max_tokens) {
        return Err(AppError::InvalidInput(format!(
            "max_tokens must be 100-32000, got {}",
            max_tokens
        )));
    }
    Ok(())
}

fn validate_trait_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let starts_ok = chars.next().map(|c| c.is_ascii_lowercase()).unwrap_or(false);
    if !starts_ok || !key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(AppError::InvalidInput(format!(
            "trait name '{}' must be snake_case",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> AgentProfile {
        NewProfile::new("quantum_scout", "Quantum Scout", Cluster::Information, "openai/gpt-4o")
            .into_profile("user-1", true)
            .unwrap()
    }

    #[test]
    fn test_trait_level_parses_strictly() {
        assert_eq!("very_high".parse::<TraitLevel>().unwrap(), TraitLevel::VeryHigh);
        assert!("Very High".parse::<TraitLevel>().is_err());
        assert!("extreme".parse::<TraitLevel>().is_err());
        assert!(TraitLevel::VeryLow < TraitLevel::VeryHigh);

        let err = serde_json::from_str::<TraitLevel>("\"extreme\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_cluster_parse() {
        assert_eq!("Reasoning".parse::<Cluster>().unwrap(), Cluster::Reasoning);
        assert!("custom".parse::<Cluster>().is_err());
    }

    #[test]
    fn test_agent_type_validation() {
        assert!(validate_agent_type("social_scout").is_ok());
        assert!(validate_agent_type("agent2").is_ok());
        assert!(validate_agent_type("").is_err());
        assert!(validate_agent_type("Social").is_err());
        assert!(validate_agent_type("has-dash").is_err());
        assert!(validate_agent_type(&"a".repeat(51)).is_err());
    }

    #[test]
    fn test_new_profile_bounds() {
        let mut input = NewProfile::new("x", "X", Cluster::Reasoning, "openai/gpt-4o");
        input.temperature = 2.5;
        assert!(input.clone().into_profile("u", true).is_err());

        input.temperature = 0.0;
        input.max_tokens = 99;
        assert!(input.clone().into_profile("u", true).is_err());

        input.max_tokens = 32000;
        input.traits.insert("Risk Preference".into(), TraitLevel::High);
        assert!(input.clone().into_profile("u", true).is_err());

        input.traits.clear();
        input.traits.insert("risk_preference".into(), TraitLevel::High);
        assert!(input.into_profile("u", true).is_ok());
    }

    #[test]
    fn test_pipeline_validation() {
        let mut pipeline = PipelineConfig::default();
        assert!(pipeline.validate().is_ok());

        pipeline.prompt.pass_threshold = 51;
        assert!(pipeline.validate().is_err());
        pipeline.prompt.pass_threshold = 40;

        pipeline.prompt.max_iterations = 4;
        assert!(pipeline.validate().is_err());
        pipeline.prompt.max_iterations = 3;

        pipeline.memory.token_budget = 0;
        assert!(pipeline.validate().is_err());
        pipeline.memory.token_budget = 100;

        pipeline.preprocessing.tasks = vec![CleanupTask::Deduplication, CleanupTask::Deduplication];
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_update_is_partial_and_validated() {
        let original = profile();
        let updated = ProfileUpdate {
            temperature: Some(0.2),
            is_enabled: Some(false),
            ..Default::default()
        }
        .apply(&original)
        .unwrap();

        assert_eq!(updated.temperature, 0.2);
        assert!(!updated.is_enabled);
        assert_eq!(updated.display_name, original.display_name);
        assert_eq!(updated.id, original.id);

        let bad = ProfileUpdate {
            max_tokens: Some(50_000),
            ..Default::default()
        };
        assert!(bad.apply(&original).is_err());
    }

    #[test]
    fn test_retrieval_request_from_memory_stage() {
        let mut p = profile();
        p.pipeline.memory.default_insights = vec!["key_findings.md".into()];
        p.pipeline.memory.token_budget = 1234;
        let request = p.retrieval_request("s1", "query");
        assert_eq!(request.requesting_agent, "quantum_scout");
        assert_eq!(request.token_budget, 1234);
        assert_eq!(request.default_insights, vec!["key_findings".to_string()]);
        assert_eq!(request.top_k, Some(5));
    }

    #[test]
    fn test_pipeline_deserializes_partial_toml_like_json() {
        let pipeline: PipelineConfig =
            serde_json::from_str(r#"{"memory": {"token_budget": 500}}"#).unwrap();
        assert_eq!(pipeline.memory.token_budget, 500);
        assert_eq!(pipeline.memory.semantic_top_k, 5);
        assert_eq!(pipeline.prompt.pass_threshold, 40);
    }
}
