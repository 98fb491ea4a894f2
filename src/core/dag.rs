//! Task DAG (Directed Acyclic Graph) for dependency scheduling.
//!
//! This module provides the `TaskDag` structure that represents task
//! dependencies as a directed acyclic graph. An edge `a -> b` means `b`
//! depends on `a`, so `a` must complete before `b` may dispatch.
//!
//! Scheduling works on a requested *subset* of the registry: edges to tasks
//! outside the subset are ignored, so a caller may run `qa` alone without
//! selecting `architect`. Use [`TaskDag::expand_with_dependencies`] when the
//! prerequisites should be pulled in instead.

use crate::core::registry::TaskRegistry;
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Dependency graph over every task in a registry.
pub struct TaskDag {
    /// Nodes are task names, edges point from dependency to dependent.
    graph: DiGraph<String, ()>,
    /// Index mapping from task name to NodeIndex for fast lookups.
    task_index: HashMap<String, NodeIndex>,
}

impl TaskDag {
    /// Build the full (unfiltered) dependency graph of a registry.
    pub fn new(registry: &TaskRegistry) -> Self {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for def in registry.definitions() {
            let index = graph.add_node(def.name.clone());
            task_index.insert(def.name.clone(), index);
        }

        for def in registry.definitions() {
            let to = task_index[&def.name];
            for dep in &def.depends_on {
                // Registry construction rejects undeclared dependencies.
                if let Some(&from) = task_index.get(dep) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        Self { graph, task_index }
    }

    /// Number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Verify the whole graph is acyclic.
    ///
    /// # Errors
    /// Returns `CyclicDependency` naming every task that sits on a cycle.
    pub fn check_acyclic(&self) -> Result<()> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }

        let mut members: Vec<String> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .flatten()
            .map(|index| self.graph[index].clone())
            .collect();
        members.sort();
        Err(Error::CyclicDependency(members))
    }

    /// Direct dependencies of a task, sorted by name.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<String>> {
        let index = self.index_of(name)?;
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| self.graph[dep].clone())
            .collect();
        deps.sort();
        Ok(deps)
    }

    /// Group the requested tasks into dependency levels.
    ///
    /// Level 0 holds tasks with no dependencies inside the subset; level `k`
    /// holds tasks whose in-subset dependencies all sit in levels `0..k`.
    /// Names within a level are sorted, though callers must treat the level
    /// as unordered. Duplicate names in the request are collapsed.
    ///
    /// # Errors
    /// - `UnknownTask` if a requested name is not in the registry.
    /// - `CyclicDependency` if the subset contains a cycle. The error lists
    ///   the tasks that could never be assigned to a level.
    pub fn dependency_levels<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Vec<String>>> {
        let mut subset: HashSet<NodeIndex> = HashSet::with_capacity(names.len());
        for name in names {
            subset.insert(self.index_of(name.as_ref())?);
        }

        // In-degree counts only edges whose source is also requested.
        let mut in_degree: HashMap<NodeIndex, usize> = subset
            .iter()
            .map(|&index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(|dep| subset.contains(dep))
                    .count();
                (index, degree)
            })
            .collect();

        let mut assigned: HashSet<NodeIndex> = HashSet::with_capacity(subset.len());
        let mut levels = Vec::new();

        loop {
            let mut level: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|(index, degree)| **degree == 0 && !assigned.contains(*index))
                .map(|(index, _)| *index)
                .collect();
            if level.is_empty() {
                break;
            }

            for &index in &level {
                assigned.insert(index);
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            level.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            levels.push(level.into_iter().map(|i| self.graph[i].clone()).collect());
        }

        if assigned.len() < subset.len() {
            let mut stuck: Vec<String> = subset
                .difference(&assigned)
                .map(|&index| self.graph[index].clone())
                .collect();
            stuck.sort();
            return Err(Error::CyclicDependency(stuck));
        }

        Ok(levels)
    }

    /// Requested tasks in an order where every dependency precedes its
    /// dependents. Independent tasks have no guaranteed relative order.
    ///
    /// # Errors
    /// Same as [`TaskDag::dependency_levels`].
    pub fn topological_sort<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        Ok(self.dependency_levels(names)?.into_iter().flatten().collect())
    }

    /// Every ancestor of `name` in the full graph, excluding `name` itself,
    /// ordered dependencies-before-dependents.
    ///
    /// # Errors
    /// - `UnknownTask` if `name` is not registered.
    /// - `CyclicDependency` if the walk re-enters a task still on the stack.
    pub fn transitive_dependencies(&self, name: &str) -> Result<Vec<String>> {
        let start = self.index_of(name)?;
        let mut visited = HashSet::new();
        let mut on_stack = Vec::new();
        let mut order = Vec::new();

        self.visit(start, &mut visited, &mut on_stack, &mut order)?;

        // Post-order ends with the start node itself.
        order.pop();
        Ok(order.into_iter().map(|index| self.graph[index].clone()).collect())
    }

    /// Union of the requested tasks and all their transitive dependencies,
    /// in topological order.
    ///
    /// # Errors
    /// Same as [`TaskDag::transitive_dependencies`].
    pub fn expand_with_dependencies<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        let mut expanded: BTreeSet<String> = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            expanded.extend(self.transitive_dependencies(name)?);
            expanded.insert(name.to_string());
        }
        let expanded: Vec<String> = expanded.into_iter().collect();
        self.topological_sort(&expanded)
    }

    /// Depth-first post-order walk over incoming (dependency) edges.
    fn visit(
        &self,
        index: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut Vec<NodeIndex>,
        order: &mut Vec<NodeIndex>,
    ) -> Result<()> {
        if visited.contains(&index) {
            return Ok(());
        }
        if let Some(pos) = on_stack.iter().position(|&i| i == index) {
            let mut cycle: Vec<String> = on_stack[pos..]
                .iter()
                .map(|&i| self.graph[i].clone())
                .collect();
            cycle.sort();
            return Err(Error::CyclicDependency(cycle));
        }

        on_stack.push(index);
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        deps.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        for dep in deps {
            self.visit(dep, visited, on_stack, order)?;
        }
        on_stack.pop();

        visited.insert(index);
        order.push(index);
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.task_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }
}

impl std::fmt::Debug for TaskDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDag")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
