//! Task graph validation and layering.
//!
//! A decomposer proposes [`TaskSpec`]s that reference each other by their
//! proposal ids. [`layer`] checks the graph with Kahn's algorithm and assigns
//! each node an execution group and an order inside it; [`build_tasks`]
//! turns the result into [`ResearchTask`] rows with fresh ids.

use crate::agents::ProfileSet;
use crate::types::{AppError, Priority, ResearchTask, Result, TaskStatus};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// One subtask as proposed by a decomposer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Proposal-local id, only meaningful inside one decomposition
    pub id: String,
    pub description: String,
    pub assigned_agent: String,
    pub priority: Priority,
    pub depends_on: Vec<String>,
    pub parent: Option<String>,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        assigned_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            assigned_agent: assigned_agent.into(),
            priority: Priority::default(),
            depends_on: Vec::new(),
            parent: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Where a spec lands in the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub group: u32,
    pub order: u32,
}

/// Validate the graph and compute a placement per spec, index-aligned.
///
/// Group 0 holds specs with no dependencies; any other spec sits one group
/// above its deepest dependency. Inside a group, order follows priority
/// (critical first) and then proposal index.
pub fn layer(specs: &[TaskSpec]) -> Result<Vec<Placement>> {
    if specs.is_empty() {
        return Err(AppError::decomposition("decomposition produced no subtasks"));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if spec.id.trim().is_empty() {
            return Err(AppError::decomposition(format!("subtask #{} has an empty id", i + 1)));
        }
        if index.insert(spec.id.as_str(), i).is_some() {
            return Err(AppError::decomposition(format!(
                "duplicate subtask id '{}'",
                spec.id
            )));
        }
    }

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut resolved = Vec::with_capacity(spec.depends_on.len());
        for dep in &spec.depends_on {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(AppError::decomposition(format!(
                    "subtask '{}' depends on unknown subtask '{}'",
                    spec.id, dep
                )));
            };
            resolved.push(j);
        }
        resolved.sort_unstable();
        resolved.dedup();
        deps.push(resolved);
    }

    // Kahn's algorithm; groups are final once a node is dequeued
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }
    let mut queue: VecDeque<usize> = (0..specs.len()).filter(|&i| indegree[i] == 0).collect();
    let mut group = vec![0u32; specs.len()];
    let mut visited = 0usize;

    while let Some(i) = queue.pop_front() {
        visited += 1;
        group[i] = deps[i].iter().map(|&d| group[d] + 1).max().unwrap_or(0);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited < specs.len() {
        let involved: Vec<&str> = (0..specs.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| specs[i].id.as_str())
            .collect();
        return Err(AppError::decomposition(format!(
            "dependency cycle among subtasks: {}",
            involved.join(", ")
        )));
    }

    let mut by_group: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (i, g) in group.iter().enumerate() {
        by_group.entry(*g).or_default().push(i);
    }
    let mut placements = vec![Placement { group: 0, order: 0 }; specs.len()];
    for (g, mut members) in by_group {
        members.sort_by_key(|&i| (specs[i].priority.rank(), i));
        for (order, i) in members.into_iter().enumerate() {
            placements[i] = Placement {
                group: g,
                order: order as u32,
            };
        }
    }
    Ok(placements)
}

/// Every spec must be bound to an agent in the enabled set
pub fn check_agents(specs: &[TaskSpec], profiles: &ProfileSet) -> Result<()> {
    match specs.iter().find(|s| !profiles.contains(&s.assigned_agent)) {
        Some(spec) => Err(AppError::missing_agent(spec.assigned_agent.clone())),
        None => Ok(()),
    }
}

/// Validate and materialize specs as pending tasks, sorted by group then order
pub fn build_tasks(
    session_id: &str,
    specs: &[TaskSpec],
    profiles: &ProfileSet,
) -> Result<Vec<ResearchTask>> {
    check_agents(specs, profiles)?;
    let placements = layer(specs)?;

    let ids: HashMap<&str, String> = specs
        .iter()
        .map(|s| (s.id.as_str(), uuid::Uuid::new_v4().to_string()))
        .collect();
    let now = Utc::now();

    let mut tasks: Vec<ResearchTask> = specs
        .iter()
        .zip(placements)
        .map(|(spec, placement)| {
            let parent_id = spec.parent.as_deref().and_then(|p| {
                let mapped = ids.get(p).cloned();
                if mapped.is_none() {
                    tracing::debug!(subtask = %spec.id, parent = %p, "ignoring unknown parent");
                }
                mapped
            });
            ResearchTask {
                id: ids[spec.id.as_str()].clone(),
                session_id: session_id.to_string(),
                parent_id,
                description: spec.description.trim().to_string(),
                assigned_agent: spec.assigned_agent.clone(),
                priority: spec.priority,
                status: TaskStatus::Pending,
                dependencies: spec
                    .depends_on
                    .iter()
                    .map(|d| ids[d.as_str()].clone())
                    .collect(),
                execution_order: placement.order,
                execution_group: placement.group,
                output: None,
                created_at: now,
                updated_at: now,
            }
        })
        .collect();

    tasks.sort_by_key(|t| (t.execution_group, t.execution_order));
    Ok(tasks)
}

/// Tasks partitioned into their execution groups, ascending
pub fn execution_groups(tasks: &[ResearchTask]) -> Vec<Vec<ResearchTask>> {
    let mut groups: BTreeMap<u32, Vec<ResearchTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.execution_group).or_default().push(task.clone());
    }
    groups
        .into_values()
        .map(|mut g| {
            g.sort_by_key(|t| t.execution_order);
            g
        })
        .collect()
}

/// Check the layering invariants on stored tasks
pub fn verify_layering(tasks: &[ResearchTask]) -> Result<()> {
    let groups: HashMap<&str, u32> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.execution_group))
        .collect();
    for task in tasks {
        if task.dependencies.is_empty() && task.execution_group != 0 {
            return Err(AppError::Internal(format!(
                "task {} has no dependencies but sits in group {}",
                task.id, task.execution_group
            )));
        }
        for dep in &task.dependencies {
            let Some(&g) = groups.get(dep.as_str()) else {
                return Err(AppError::Internal(format!(
                    "task {} depends on missing task {}",
                    task.id, dep
                )));
            };
            if g >= task.execution_group {
                return Err(AppError::Internal(format!(
                    "task {} (group {}) depends on {} (group {})",
                    task.id, task.execution_group, dep, g
                )));
            }
        }
    }
    Ok(())
}
