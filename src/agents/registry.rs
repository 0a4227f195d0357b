//! Profile registry
//!
//! Holds every owner's agent profiles. Reads are lock-free snapshots through
//! `ArcSwap`; writers are serialized and publish a new table atomically, so a
//! research run keeps the [`ProfileSet`] it started with even if profiles are
//! edited mid-run.

use super::defaults::{template, DEFAULT_AGENTS};
use super::profile::{AgentProfile, Cluster, NewProfile, ProfileUpdate};
use crate::types::{AppError, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Owner used by the command line
pub const DEFAULT_OWNER: &str = "local";

type ProfileTable = BTreeMap<(String, String), AgentProfile>;

/// Registry of agent profiles keyed by `(owner, agent_type)`
pub struct ProfileRegistry {
    table: ArcSwap<ProfileTable>,
    write_lock: Mutex<()>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(ProfileTable::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Registry pre-seeded with the default templates for `owner`
    pub fn with_defaults(owner: &str) -> Result<Self> {
        let registry = Self::new();
        registry.init_defaults(owner)?;
        Ok(registry)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut ProfileTable) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut next = ProfileTable::clone(&self.table.load());
        let out = f(&mut next)?;
        self.table.store(Arc::new(next));
        Ok(out)
    }

    fn key(owner: &str, agent_type: &str) -> (String, String) {
        (owner.to_string(), agent_type.to_string())
    }

    /// Create the default profiles for `owner` unless it already has them.
    ///
    /// Returns the number of profiles created.
    pub fn init_defaults(&self, owner: &str) -> Result<usize> {
        self.modify(|table| {
            let has_defaults = table
                .iter()
                .any(|((o, _), p)| o == owner && !p.is_custom);
            if has_defaults {
                return Ok(0);
            }
            let mut created = 0;
            for t in DEFAULT_AGENTS.iter() {
                let key = Self::key(owner, t.agent_type);
                if table.contains_key(&key) {
                    continue;
                }
                let profile = t.to_new_profile().into_profile(owner, false)?;
                table.insert(key, profile);
                created += 1;
            }
            info!(owner, created, "default agent profiles initialized");
            Ok(created)
        })
    }

    /// Create a custom profile
    pub fn create(&self, owner: &str, input: NewProfile) -> Result<AgentProfile> {
        let profile = input.into_profile(owner, true)?;
        self.modify(|table| {
            let key = Self::key(owner, &profile.agent_type);
            if table.contains_key(&key) {
                return Err(AppError::Conflict(format!(
                    "agent '{}' already exists",
                    profile.agent_type
                )));
            }
            table.insert(key, profile.clone());
            Ok(profile)
        })
    }

    pub fn get(&self, owner: &str, agent_type: &str) -> Option<AgentProfile> {
        self.table.load().get(&Self::key(owner, agent_type)).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<AgentProfile> {
        self.table.load().values().find(|p| p.id == id).cloned()
    }

    /// Profiles of `owner`: defaults in template order, then custom ones by type
    pub fn list(&self, owner: &str, cluster: Option<Cluster>) -> Vec<AgentProfile> {
        let table = self.table.load();
        let mut profiles: Vec<AgentProfile> = table
            .iter()
            .filter(|((o, _), p)| o == owner && cluster.map(|c| p.cluster == c).unwrap_or(true))
            .map(|(_, p)| p.clone())
            .collect();
        profiles.sort_by_key(|p| (template_rank(&p.agent_type, p.is_custom), p.agent_type.clone()));
        profiles
    }

    /// Apply a partial update
    pub fn update(&self, owner: &str, agent_type: &str, update: ProfileUpdate) -> Result<AgentProfile> {
        self.modify(|table| {
            let key = Self::key(owner, agent_type);
            let current = table
                .get(&key)
                .ok_or_else(|| AppError::NotFound(format!("agent profile '{}'", agent_type)))?;
            let updated = update.apply(current)?;
            table.insert(key, updated.clone());
            Ok(updated)
        })
    }

    /// Delete a custom profile. Defaults can only be reset.
    pub fn delete(&self, owner: &str, agent_type: &str) -> Result<()> {
        self.modify(|table| {
            let key = Self::key(owner, agent_type);
            let profile = table
                .get(&key)
                .ok_or_else(|| AppError::NotFound(format!("agent profile '{}'", agent_type)))?;
            if !profile.is_custom {
                return Err(AppError::Conflict(format!(
                    "'{}' is a default agent and cannot be deleted; reset it instead",
                    agent_type
                )));
            }
            table.remove(&key);
            Ok(())
        })
    }

    /// Restore a default profile to its template values
    pub fn reset(&self, owner: &str, agent_type: &str) -> Result<AgentProfile> {
        self.modify(|table| {
            let key = Self::key(owner, agent_type);
            let current = table
                .get(&key)
                .ok_or_else(|| AppError::NotFound(format!("agent profile '{}'", agent_type)))?;
            let t = match (current.is_custom, template(agent_type)) {
                (false, Some(t)) => t,
                _ => {
                    return Err(AppError::InvalidInput(format!(
                        "'{}' is a custom agent and has no template to reset to",
                        agent_type
                    )))
                }
            };
            let mut fresh = t.to_new_profile().into_profile(owner, false)?;
            fresh.id = current.id.clone();
            fresh.created_at = current.created_at;
            fresh.updated_at = Utc::now();
            table.insert(key, fresh.clone());
            Ok(fresh)
        })
    }

    /// Copy a profile as a new custom `{agent_type}_copy`
    pub fn clone_profile(&self, owner: &str, agent_type: &str) -> Result<AgentProfile> {
        self.modify(|table| {
            let source = table
                .get(&Self::key(owner, agent_type))
                .ok_or_else(|| AppError::NotFound(format!("agent profile '{}'", agent_type)))?;

            let mut input = NewProfile::new(
                format!("{}_copy", source.agent_type),
                format!("{} (Copy)", source.display_name),
                source.cluster,
                source.role_model.clone(),
            );
            input.fallback_model = source.fallback_model.clone();
            input.temperature = source.temperature;
            input.max_tokens = source.max_tokens;
            input.persona = source.persona.clone();
            input.traits = source.traits.clone();
            input.responsibilities = source.responsibilities.clone();
            input.pipeline = Some(source.pipeline.clone());
            input.data_sources = source.data_sources.clone();
            input.enabled_skills = source.enabled_skills.clone();

            let copy = input.into_profile(owner, true)?;
            let key = Self::key(owner, &copy.agent_type);
            if table.contains_key(&key) {
                return Err(AppError::Conflict(format!(
                    "agent '{}' already exists",
                    copy.agent_type
                )));
            }
            table.insert(key, copy.clone());
            Ok(copy)
        })
    }

    /// Enabled profiles of `owner`, frozen for one run
    pub fn snapshot(&self, owner: &str) -> ProfileSet {
        let enabled = self
            .list(owner, None)
            .into_iter()
            .filter(|p| p.is_enabled)
            .collect();
        ProfileSet { profiles: enabled }
    }
}

fn template_rank(agent_type: &str, is_custom: bool) -> usize {
    if is_custom {
        return DEFAULT_AGENTS.len();
    }
    DEFAULT_AGENTS
        .iter()
        .position(|t| t.agent_type == agent_type)
        .unwrap_or(DEFAULT_AGENTS.len())
}

/// An immutable set of enabled profiles with unique agent types
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: Vec<AgentProfile>,
}

impl ProfileSet {
    pub fn new(profiles: Vec<AgentProfile>) -> Result<Self> {
        for (i, p) in profiles.iter().enumerate() {
            if profiles[..i].iter().any(|q| q.agent_type == p.agent_type) {
                return Err(AppError::Conflict(format!(
                    "agent '{}' appears twice",
                    p.agent_type
                )));
            }
        }
        Ok(Self {
            profiles: profiles.into_iter().filter(|p| p.is_enabled).collect(),
        })
    }

    pub fn get(&self, agent_type: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.agent_type == agent_type)
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.get(agent_type).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.profiles.iter()
    }

    pub fn agent_types(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.agent_type.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
