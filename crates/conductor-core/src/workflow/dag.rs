//! Dependency resolver, cycle detection, and batch computation.
//!
//! Steps are modelled as a `petgraph` `DiGraph` with an edge from every
//! dependency to its dependent. The execution order comes from a depth-first
//! traversal that keeps a *visiting* set (a back edge means a cycle) and a
//! *visited* set, visiting roots in declaration order so the result is
//! deterministic. Batches group steps by depth (longest dependency chain).

use std::collections::{HashMap, HashSet};

use conductor_types::workflow::WorkflowStep;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// One unit of dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// A step that runs on its own.
    Single(String),
    /// Parallel-enabled steps of one depth that may run concurrently.
    ParallelGroup { index: usize, steps: Vec<String> },
}

impl Batch {
    pub fn step_ids(&self) -> &[String] {
        match self {
            Batch::Single(id) => std::slice::from_ref(id),
            Batch::ParallelGroup { steps, .. } => steps,
        }
    }

    pub fn group_index(&self) -> Option<usize> {
        match self {
            Batch::Single(_) => None,
            Batch::ParallelGroup { index, .. } => Some(*index),
        }
    }
}

/// Resolved order and dispatch batches for a step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Topological order: every step appears after all its dependencies.
    pub order: Vec<String>,
    /// Dispatch units, in execution order.
    pub batches: Vec<Batch>,
    depths: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Depth of a step (0 for roots).
    pub fn depth(&self, step_id: &str) -> Option<usize> {
        self.depths.get(step_id).copied()
    }

    /// Number of parallel groups in the plan.
    pub fn group_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b, Batch::ParallelGroup { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

struct StepGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

fn build_graph(steps: &[WorkflowStep]) -> Result<StepGraph<'_>, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();
    for step in steps {
        let node = graph.add_node(step.id.as_str());
        if index.insert(step.id.as_str(), node).is_some() {
            return Err(WorkflowError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in steps {
        let to = index[step.id.as_str()];
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(WorkflowError::Dependency(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
            let from = index.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::Dependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    Ok(StepGraph { graph, index })
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Topologically order steps with a depth-first traversal.
pub fn execution_order(steps: &[WorkflowStep]) -> Result<Vec<String>, WorkflowError> {
    // Graph construction rejects unknown references before traversal.
    build_graph(steps)?;

    let by_id: HashMap<&str, &WorkflowStep> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visiting: Vec<&str> = Vec::new();
    let mut visiting_set: HashSet<&str> = HashSet::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());

    for step in steps {
        visit(
            step.id.as_str(),
            &by_id,
            &mut visiting,
            &mut visiting_set,
            &mut visited,
            &mut order,
        )?;
    }

    Ok(order)
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a WorkflowStep>,
    visiting: &mut Vec<&'a str>,
    visiting_set: &mut HashSet<&'a str>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<String>,
) -> Result<(), WorkflowError> {
    if visited.contains(id) {
        return Ok(());
    }
    if visiting_set.contains(id) {
        let start = visiting.iter().position(|v| *v == id).unwrap_or(0);
        let mut path: Vec<String> = visiting[start..].iter().map(|s| s.to_string()).collect();
        path.push(id.to_string());
        return Err(WorkflowError::CircularDependency { path });
    }

    visiting.push(id);
    visiting_set.insert(id);

    if let Some(&step) = by_id.get(id) {
        for dep in &step.depends_on {
            visit(dep.as_str(), by_id, visiting, visiting_set, visited, order)?;
        }
    }

    visiting.pop();
    visiting_set.remove(id);
    visited.insert(id);
    order.push(id.to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Resolve the order and dispatch batches for a step list.
///
/// Within one depth, every parallel-enabled step joins a single
/// `ParallelGroup` (a lone parallel step stays `Single`); other steps become
/// `Single` batches in topological order.
pub fn resolve(steps: &[WorkflowStep]) -> Result<ExecutionPlan, WorkflowError> {
    let order = execution_order(steps)?;
    let by_id: HashMap<&str, &WorkflowStep> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut depths: HashMap<String, usize> = HashMap::new();
    for id in &order {
        let depth = by_id[id.as_str()]
            .depends_on
            .iter()
            .map(|dep| depths.get(dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(id.clone(), depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<&str>> = vec![Vec::new(); max_depth + 1];
    for id in &order {
        levels[depths[id]].push(id.as_str());
    }

    let mut batches = Vec::new();
    let mut group_index = 0;
    for level in levels {
        let parallel: Vec<String> = level
            .iter()
            .filter(|id| by_id[**id].is_parallel())
            .map(|id| id.to_string())
            .collect();
        let grouped = parallel.len() > 1;
        let mut group_placed = false;

        for id in level {
            if grouped && by_id[id].is_parallel() {
                if !group_placed {
                    batches.push(Batch::ParallelGroup {
                        index: group_index,
                        steps: parallel.clone(),
                    });
                    group_index += 1;
                    group_placed = true;
                }
            } else {
                batches.push(Batch::Single(id.to_string()));
            }
        }
    }

    tracing::debug!(
        steps = order.len(),
        batches = batches.len(),
        groups = group_index,
        "resolved execution plan"
    );

    Ok(ExecutionPlan {
        order,
        batches,
        depths,
    })
}

// ---------------------------------------------------------------------------
// Closures
// ---------------------------------------------------------------------------

/// Every step `step_id` depends on, directly or transitively, in declaration
/// order. Empty when `step_id` is unknown.
pub fn transitive_dependencies(step_id: &str, steps: &[WorkflowStep]) -> Vec<String> {
    reachable(step_id, steps, Direction::Incoming)
}

/// Every step that depends on `step_id`, directly or transitively, in
/// declaration order. Empty when `step_id` is unknown.
pub fn dependents(step_id: &str, steps: &[WorkflowStep]) -> Vec<String> {
    reachable(step_id, steps, Direction::Outgoing)
}

fn reachable(step_id: &str, steps: &[WorkflowStep], direction: Direction) -> Vec<String> {
    let Ok(StepGraph { graph, index }) = build_graph(steps) else {
        return Vec::new();
    };
    let Some(&start) = index.get(step_id) else {
        return Vec::new();
    };

    let mut found: HashSet<&str> = HashSet::new();
    match direction {
        Direction::Outgoing => {
            let mut dfs = Dfs::new(&graph, start);
            while let Some(node) = dfs.next(&graph) {
                found.insert(graph[node]);
            }
        }
        Direction::Incoming => {
            let reversed = Reversed(&graph);
            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                found.insert(graph[node]);
            }
        }
    }
    found.remove(step_id);

    steps
        .iter()
        .filter(|s| found.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
