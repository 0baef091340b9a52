//! Dependency graph between jobs.
//!
//! Edges are stored as two adjacency maps keyed by job id; the id is the
//! weak reference, so parent and child records never point at each other
//! directly. Edge insertion runs a depth-first cycle check and rolls the
//! new edges back if one is found; the graph is a DAG at all times.
//!
//! The graph is not internally synchronized. The scheduler serializes all
//! access (submission and cascade) behind a single lock, which is adequate
//! at this scale.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while mutating the graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An edge references a job that has not been registered.
    #[error("Unknown parent job {0}")]
    UnknownParent(Uuid),

    /// Inserting the edges would create a cycle.
    #[error("Dependency cycle detected involving job {0}")]
    CycleDetected(Uuid),
}

/// Parent/child adjacency over job ids.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// child id -> parent ids it depends on.
    parents: HashMap<Uuid, HashSet<Uuid>>,
    /// parent id -> child ids depending on it.
    children: HashMap<Uuid, HashSet<Uuid>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the job is known to the graph.
    pub fn contains(&self, id: Uuid) -> bool {
        self.parents.contains_key(&id)
    }

    /// Number of known jobs.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Registers a new job and its dependency edges.
    ///
    /// Every parent must already be known. Forward references are rejected
    /// because without a submission-order guarantee they would make cycle
    /// detection non-terminating. On any error the graph is unchanged.
    pub fn add_job(&mut self, id: Uuid, parent_ids: &[Uuid]) -> Result<(), GraphError> {
        debug_assert!(!self.contains(id), "job {id} registered twice");

        self.parents.entry(id).or_default();
        self.children.entry(id).or_default();

        if let Err(err) = self.link(id, parent_ids) {
            self.parents.remove(&id);
            self.children.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Adds dependency edges from an existing job to the given parents.
    ///
    /// Runs cycle detection by DFS from `id` over forward (`children`)
    /// edges; if any path leads back to `id`, the newly inserted edges are
    /// rolled back and `CycleDetected` is returned.
    pub fn link(&mut self, id: Uuid, parent_ids: &[Uuid]) -> Result<(), GraphError> {
        if !self.parents.contains_key(&id) {
            return Err(GraphError::UnknownParent(id));
        }
        for parent in parent_ids {
            if *parent == id {
                return Err(GraphError::CycleDetected(id));
            }
            if !self.parents.contains_key(parent) {
                return Err(GraphError::UnknownParent(*parent));
            }
        }

        // Only edges that did not already exist are inserted, and only those
        // are rolled back on a cycle.
        let existing = &self.parents[&id];
        let inserted: HashSet<Uuid> = parent_ids
            .iter()
            .copied()
            .filter(|p| !existing.contains(p))
            .collect();

        for parent in &inserted {
            self.children.entry(*parent).or_default().insert(id);
        }
        if let Some(parents) = self.parents.get_mut(&id) {
            parents.extend(inserted.iter().copied());
        }

        if self.reaches_itself(id) {
            for parent in &inserted {
                if let Some(children) = self.children.get_mut(parent) {
                    children.remove(&id);
                }
            }
            if let Some(parents) = self.parents.get_mut(&id) {
                for parent in &inserted {
                    parents.remove(parent);
                }
            }
            return Err(GraphError::CycleDetected(id));
        }

        Ok(())
    }

    /// DFS over forward (`children`) edges looking for a path back to `start`.
    fn reaches_itself(&self, start: Uuid) -> bool {
        let mut stack: Vec<Uuid> = self
            .children
            .get(&start)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        let mut visited: HashSet<Uuid> = HashSet::new();

        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(children) = self.children.get(&node) {
                stack.extend(children.iter().copied());
            }
        }
        false
    }

    /// Parents of a job. Empty if the job has no dependencies or is unknown.
    pub fn parents_of(&self, id: Uuid) -> Vec<Uuid> {
        self.parents
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct children of a job.
    pub fn children_of(&self, id: Uuid) -> Vec<Uuid> {
        self.children
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Removes a job and both directions of its edges (retention hook).
    pub fn remove_job(&mut self, id: Uuid) {
        if let Some(parents) = self.parents.remove(&id) {
            for parent in parents {
                if let Some(children) = self.children.get_mut(&parent) {
                    children.remove(&id);
                }
            }
        }
        if let Some(children) = self.children.remove(&id) {
            for child in children {
                if let Some(parents) = self.parents.get_mut(&child) {
                    parents.remove(&id);
                }
            }
        }
    }
}
