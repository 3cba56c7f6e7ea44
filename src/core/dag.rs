//! Dependency graph for workflow tasks.
//!
//! This module provides the `DependencyGraph` that represents task
//! dependencies as a directed acyclic graph, partitions it into execution
//! levels, and answers readiness questions for the executor.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// Type of dependency between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The dependent only runs once the dependency has completed.
    #[default]
    Hard,
    /// The dependent waits for the dependency to finish but runs even if it
    /// did not complete; the outcome is recorded as a warning.
    Soft,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Hard => write!(f, "hard"),
            DependencyType::Soft => write!(f, "soft"),
        }
    }
}

/// A set of tasks with no edges between them, runnable concurrently.
///
/// Every task in level `n` depends only on tasks in levels `< n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLevel {
    pub index: usize,
    pub tasks: Vec<TaskId>,
}

impl ExecutionLevel {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Whether a task may be dispatched given the status of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// All hard dependencies completed and all soft dependencies finished.
    Ready {
        /// One entry per soft dependency that did not complete.
        warnings: Vec<String>,
    },
    /// At least one dependency has not reached a terminal status yet.
    Waiting,
    /// A hard dependency finished without completing; the task can never run.
    Blocked { dependency: TaskId, status: TaskStatus },
}

/// The task dependency graph.
///
/// Nodes are task ids; an edge `a -> b` means `b` depends on `a`. Node
/// indices follow insertion order, which is also the order tasks appear in
/// within an execution level.
///
/// The graph is always acyclic: any mutation that would introduce a cycle is
/// rolled back before the error is returned.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyType>,
    index: HashMap<TaskId, NodeIndex>,
    tasks: HashMap<TaskId, Task>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Build a graph from task definitions and check it is complete.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `CyclicDependency` if the dependencies form a cycle
    /// - `UnknownTask` if a task depends on an id that is not defined
    pub fn from_tasks<I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        let mut graph = Self::new();

        // Register nodes up front so level order follows definition order
        // even when a task references one defined further down.
        let mut registered = Vec::new();
        for task in &tasks {
            graph.ensure_node(&task.id, &mut registered);
        }
        for task in tasks {
            graph.add_task(task)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task definition together with its declared dependencies.
    ///
    /// Dependencies that are not defined yet are inserted as placeholder
    /// nodes and must be defined before the graph is executed.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        self.add_dependency(&task.id, &task.depends_on, task.dependency_type)?;
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Insert `task` and an edge from each of `depends_on` to it.
    ///
    /// Cycle detection runs right after insertion; on a cycle, every node
    /// and edge added by this call is removed again and the graph is left
    /// exactly as it was.
    ///
    /// # Errors
    /// Returns `CyclicDependency { task_id }` if the new edges close a cycle.
    pub fn add_dependency(
        &mut self,
        task: &TaskId,
        depends_on: &[TaskId],
        dep_type: DependencyType,
    ) -> Result<()> {
        let mut new_nodes = Vec::new();
        let mut new_edges = Vec::new();

        let task_index = self.ensure_node(task, &mut new_nodes);
        for dep in depends_on {
            let dep_index = self.ensure_node(dep, &mut new_nodes);
            if self.graph.find_edge(dep_index, task_index).is_some() {
                continue;
            }
            new_edges.push(self.graph.add_edge(dep_index, task_index, dep_type));
        }

        if is_cyclic_directed(&self.graph) {
            self.rollback(new_nodes, new_edges);
            warn!(task_id = %task, "rejected dependency that would create a cycle");
            return Err(Error::CyclicDependency {
                task_id: task.clone(),
            });
        }

        debug!(task_id = %task, edges = new_edges.len(), "dependencies added");
        Ok(())
    }

    fn ensure_node(&mut self, id: &TaskId, new_nodes: &mut Vec<NodeIndex>) -> NodeIndex {
        if let Some(&index) = self.index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), index);
        new_nodes.push(index);
        index
    }

    /// Undo an insertion. Removal runs newest-first so petgraph's
    /// swap-remove never relocates an index that is still in use.
    fn rollback(&mut self, new_nodes: Vec<NodeIndex>, new_edges: Vec<EdgeIndex>) {
        for edge in new_edges.into_iter().rev() {
            self.graph.remove_edge(edge);
        }
        for node in new_nodes.into_iter().rev() {
            if let Some(id) = self.graph.remove_node(node) {
                self.index.remove(&id);
            }
        }
    }

    /// Check that every node referenced by an edge has a task definition.
    pub fn validate(&self) -> Result<()> {
        for id in self.graph.node_weights() {
            if !self.tasks.contains_key(id) {
                return Err(Error::UnknownTask(id.clone()));
            }
        }
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All task ids in insertion order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph.node_weights().cloned().collect()
    }

    /// All defined tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Whether `task` depends on `dependency`.
    pub fn has_dependency(&self, dependency: &TaskId, task: &TaskId) -> bool {
        self.dependency_type(dependency, task).is_some()
    }

    pub fn dependency_type(&self, dependency: &TaskId, task: &TaskId) -> Option<DependencyType> {
        let from = self.index.get(dependency)?;
        let to = self.index.get(task)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Direct predecessors of a task with the type of each edge.
    pub fn dependencies(&self, id: &TaskId) -> Vec<(TaskId, DependencyType)> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<(NodeIndex, DependencyType)> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
            .collect();
        deps.sort_by_key(|(node, _)| node.index());
        deps.into_iter()
            .map(|(node, dep_type)| (self.graph[node].clone(), dep_type))
            .collect()
    }

    /// Direct successors of a task, in insertion order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents_filtered(id, |_| true)
    }

    fn dependents_filtered<F>(&self, id: &TaskId, keep: F) -> Vec<TaskId>
    where
        F: Fn(DependencyType) -> bool,
    {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|edge| keep(*edge.weight()))
            .map(|edge| edge.target())
            .collect();
        nodes.sort_by_key(|node| node.index());
        nodes.into_iter().map(|node| self.graph[node].clone()).collect()
    }

    /// Every task reachable from `id` through hard edges.
    ///
    /// These are the tasks that can no longer run once `id` fails. Soft
    /// edges stop the propagation: a soft dependent still runs.
    pub fn hard_dependents_transitive(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([id.clone()]);

        while let Some(current) = queue.pop_front() {
            for next in self.dependents_filtered(&current, |t| t == DependencyType::Hard) {
                if seen.insert(next.clone()) {
                    order.push(next.clone());
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Partition the graph into execution levels (Kahn's algorithm).
    ///
    /// Each level is the frontier of tasks whose in-degree dropped to zero
    /// after the previous level was removed. Within a level, tasks keep
    /// insertion order.
    ///
    /// # Errors
    /// Returns `CyclicDependency` if some tasks can never be reduced. This
    /// cannot happen for graphs built through `add_dependency`.
    pub fn topological_levels(&self) -> Result<Vec<ExecutionLevel>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|node| {
                self.graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut frontier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|node| in_degree[node.index()] == 0)
            .collect();

        let mut levels = Vec::new();
        let mut consumed = 0;

        while !frontier.is_empty() {
            consumed += frontier.len();
            let mut next = Vec::new();
            for &node in &frontier {
                for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    in_degree[succ.index()] -= 1;
                    if in_degree[succ.index()] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_by_key(|node| node.index());

            levels.push(ExecutionLevel {
                index: levels.len(),
                tasks: frontier.iter().map(|&node| self.graph[node].clone()).collect(),
            });
            frontier = next;
        }

        if consumed < self.graph.node_count() {
            let stuck = self
                .graph
                .node_indices()
                .find(|node| in_degree[node.index()] > 0)
                .map(|node| self.graph[node].clone())
                .unwrap_or_else(|| TaskId::from("unknown"));
            return Err(Error::CyclicDependency { task_id: stuck });
        }

        Ok(levels)
    }

    /// Decide whether a task can be dispatched.
    pub fn readiness<F>(&self, id: &TaskId, status_of: F) -> Readiness
    where
        F: Fn(&TaskId) -> TaskStatus,
    {
        let mut warnings = Vec::new();
        let mut waiting = false;

        for (dep, dep_type) in self.dependencies(id) {
            let status = status_of(&dep);
            match (dep_type, status) {
                (_, TaskStatus::Completed) => {}
                (_, s) if !s.is_terminal() => waiting = true,
                (DependencyType::Hard, s) => {
                    return Readiness::Blocked {
                        dependency: dep,
                        status: s,
                    }
                }
                (DependencyType::Soft, s) => {
                    warnings.push(format!("soft dependency {} ended {}", dep, s));
                }
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready { warnings }
        }
    }

    /// Pending tasks whose dependencies allow dispatch, in insertion order.
    ///
    /// Soft dependencies that did not complete are logged as warnings and
    /// do not block readiness.
    pub fn ready_tasks<F>(&self, status_of: F) -> Vec<TaskId>
    where
        F: Fn(&TaskId) -> TaskStatus,
    {
        self.graph
            .node_weights()
            .filter(|id| status_of(id) == TaskStatus::Pending)
            .filter(|id| match self.readiness(id, &status_of) {
                Readiness::Ready { warnings } => {
                    for warning in warnings {
                        warn!(task_id = %id, "{}", warning);
                    }
                    true
                }
                _ => false,
            })
            .cloned()
            .collect()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
