//! Structural validation, cycle/conflict detection, layering, and metrics
//! for a [`Plan`].

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Graph;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;

use crate::plan::{Plan, Task};

/// A pair of tasks that both write the same path with no directed path
/// between them, so they could legally run concurrently but would race.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub task_a: String,
    pub task_b: String,
    pub path: String,
}

/// A task id in `requires` that names a task not present in the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingDependency {
    pub task: String,
    pub missing: String,
}

/// The full outcome of validating a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub circular_dependencies: Vec<Vec<String>>,
    pub missing_dependencies: Vec<MissingDependency>,
    /// Tasks with no incoming or outgoing dependency edges, in a plan with
    /// more than one task. Advisory only — never makes a plan invalid.
    pub orphaned_tasks: Vec<String>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
            && self.conflicts.is_empty()
            && self.circular_dependencies.is_empty()
            && self.missing_dependencies.is_empty()
    }
}

/// Aggregate metrics derived from a validated plan's layering.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub task_count: usize,
    pub execution_layers: usize,
    pub max_parallelization: usize,
    pub critical_path_length: u64,
    pub total_estimated_lines: u64,
    pub estimated_speedup: f64,
}

fn structural_errors(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();

    for task in &plan.tasks {
        if task.id.is_empty() {
            errors.push("task has an empty id".to_string());
            continue;
        }
        if !seen_ids.insert(task.id.clone()) {
            errors.push(format!("duplicate task id: {}", task.id));
        }
        if task.title.trim().is_empty() {
            errors.push(format!("task {} has an empty title", task.id));
        }
        if task.description.trim().is_empty() {
            errors.push(format!("task {} has an empty description", task.id));
        }
        if task.agent_prompt.trim().is_empty() {
            errors.push(format!("task {} has an empty agent prompt", task.id));
        }
        if task.estimated_lines == 0 {
            errors.push(format!("task {} has a non-positive estimated size", task.id));
        }
        let mut write_seen = HashSet::new();
        for path in &task.writes {
            if !write_seen.insert(path) {
                errors.push(format!("task {} writes {} more than once", task.id, path));
            }
        }
    }

    errors
}

/// Build a petgraph digraph over task ids, edges pointing dependency -> dependent.
fn build_graph(plan: &Plan) -> (Graph<String, ()>, HashMap<String, NodeIndex>) {
    let mut graph = Graph::new();
    let mut index_of = HashMap::new();

    for task in &plan.tasks {
        let idx = graph.add_node(task.id.clone());
        index_of.insert(task.id.clone(), idx);
    }

    for task in &plan.tasks {
        let Some(&to) = index_of.get(&task.id) else {
            continue;
        };
        for dep in &task.requires {
            if let Some(&from) = index_of.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }

    (graph, index_of)
}

/// Run the full validation pipeline described for the DAG validator:
/// structural errors, missing dependencies, cycles, and parallel file
/// conflicts.
pub fn validate(plan: &Plan) -> ValidationReport {
    let mut report = ValidationReport {
        errors: structural_errors(plan),
        ..Default::default()
    };

    let known_ids: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &plan.tasks {
        for dep in &task.requires {
            if !known_ids.contains(dep.as_str()) {
                report.missing_dependencies.push(MissingDependency {
                    task: task.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    // Missing dependencies would make cycle/conflict analysis meaningless
    // (edges to nonexistent nodes), so only proceed once the graph is
    // well-formed against the ids it claims to reference.
    if !report.missing_dependencies.is_empty() {
        return report;
    }

    let (graph, index_of) = build_graph(plan);

    for scc in tarjan_scc(&graph) {
        if scc.len() > 1 {
            let mut ids: Vec<String> = scc.iter().map(|&idx| graph[idx].clone()).collect();
            ids.sort();
            report.circular_dependencies.push(ids);
        }
    }
    // A self-dependency (a -> a) is a cycle of size one that tarjan_scc
    // reports as a singleton SCC, so it's invisible to the `len() > 1` check
    // above; detect it directly from self-loop edges instead.
    for task in &plan.tasks {
        if task.requires.contains(&task.id) {
            report.circular_dependencies.push(vec![task.id.clone()]);
        }
    }

    if report.circular_dependencies.is_empty() {
        report.conflicts = find_conflicts(plan, &graph, &index_of);
        report.orphaned_tasks = find_orphans(plan);
    }

    report
}

/// For every file written by more than one task, report the pairs with no
/// directed reachability between them in either direction (computed by BFS
/// over the dependency graph, as the spec requires).
fn find_conflicts(
    plan: &Plan,
    graph: &Graph<String, ()>,
    index_of: &HashMap<String, NodeIndex>,
) -> Vec<Conflict> {
    // Normalize so `./src/a.rs` and `src/a.rs` are recognized as the same
    // write target instead of slipping past this check as distinct paths.
    let mut writers: HashMap<String, Vec<&Task>> = HashMap::new();
    for task in &plan.tasks {
        for path in &task.writes {
            writers.entry(crate::path::normalize_task_path(path)).or_default().push(task);
        }
    }

    let mut reachability_cache: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
    let mut reachable_from = |idx: NodeIndex| -> HashSet<NodeIndex> {
        reachability_cache
            .entry(idx)
            .or_insert_with(|| bfs_reachable(graph, idx))
            .clone()
    };

    let mut conflicts = Vec::new();
    let mut seen_pairs = HashSet::new();

    for (path, tasks) in writers {
        if tasks.len() < 2 {
            continue;
        }
        for i in 0..tasks.len() {
            for j in (i + 1)..tasks.len() {
                let a = tasks[i];
                let b = tasks[j];
                let (Some(&idx_a), Some(&idx_b)) = (index_of.get(&a.id), index_of.get(&b.id))
                else {
                    continue;
                };
                let a_reaches_b = reachable_from(idx_a).contains(&idx_b);
                let b_reaches_a = reachable_from(idx_b).contains(&idx_a);
                if a_reaches_b || b_reaches_a {
                    continue;
                }
                let key = if a.id <= b.id {
                    (a.id.clone(), b.id.clone(), path.to_string())
                } else {
                    (b.id.clone(), a.id.clone(), path.to_string())
                };
                if seen_pairs.insert(key.clone()) {
                    conflicts.push(Conflict {
                        task_a: key.0,
                        task_b: key.1,
                        path: key.2,
                    });
                }
            }
        }
    }

    conflicts
}

fn bfs_reachable(graph: &Graph<String, ()>, start: NodeIndex) -> HashSet<NodeIndex> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start);
    while let Some(node) = queue.pop_front() {
        for neighbor in graph.neighbors(node) {
            if visited.insert(neighbor) {
                queue.push_back(neighbor);
            }
        }
    }
    visited
}

fn find_orphans(plan: &Plan) -> Vec<String> {
    if plan.tasks.len() < 2 {
        return Vec::new();
    }
    let has_incoming: HashSet<&str> = plan
        .tasks
        .iter()
        .flat_map(|t| t.requires.iter().map(String::as_str))
        .collect();
    let has_outgoing: HashSet<&str> = plan
        .tasks
        .iter()
        .filter(|t| !t.requires.is_empty())
        .map(|t| t.id.as_str())
        .collect();

    plan.tasks
        .iter()
        .filter(|t| !has_incoming.contains(t.id.as_str()) && !has_outgoing.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect()
}

/// Topologically order tasks into layers, placing each task in the smallest
/// layer index strictly greater than the maximum layer index of its
/// dependencies. Only meaningful for a plan that passed [`validate`].
pub fn layers(plan: &Plan) -> Vec<Vec<String>> {
    let mut layer_of: HashMap<&str, usize> = HashMap::new();
    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    fn resolve<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        layer_of: &mut HashMap<&'a str, usize>,
        visiting: &mut HashSet<&'a str>,
    ) -> usize {
        if let Some(&layer) = layer_of.get(id) {
            return layer;
        }
        // A plan that reached this point has already been validated
        // cycle-free; `visiting` is just a backstop against recursing
        // forever if it hasn't.
        if !visiting.insert(id) {
            return 0;
        }
        let task = by_id[id];
        let layer = task
            .requires
            .iter()
            .filter_map(|dep| by_id.get(dep.as_str()).map(|_| dep.as_str()))
            .map(|dep| resolve(dep, by_id, layer_of, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(id);
        layer_of.insert(id, layer);
        layer
    }

    let mut visiting = HashSet::new();
    for task in &plan.tasks {
        resolve(&task.id, &by_id, &mut layer_of, &mut visiting);
    }

    let max_layer = layer_of.values().copied().max();
    let Some(max_layer) = max_layer else {
        return Vec::new();
    };

    let mut result = vec![Vec::new(); max_layer + 1];
    // Preserve the plan's original task order within each layer.
    for task in &plan.tasks {
        let layer = layer_of[task.id.as_str()];
        result[layer].push(task.id.clone());
    }
    result
}

/// Compute the metrics described for the DAG validator from a plan and its
/// layering.
pub fn metrics(plan: &Plan, layers: &[Vec<String>]) -> Metrics {
    if plan.tasks.is_empty() {
        return Metrics::default();
    }

    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut critical_path: HashMap<&str, u64> = HashMap::new();

    fn resolve<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        memo: &mut HashMap<&'a str, u64>,
    ) -> u64 {
        if let Some(&v) = memo.get(id) {
            return v;
        }
        let task = by_id[id];
        let best_dep = task
            .requires
            .iter()
            .filter_map(|d| by_id.get(d.as_str()).map(|_| d.as_str()))
            .map(|d| resolve(d, by_id, memo))
            .max()
            .unwrap_or(0);
        let total = best_dep + u64::from(task.estimated_lines);
        memo.insert(id, total);
        total
    }

    for task in &plan.tasks {
        resolve(&task.id, &by_id, &mut critical_path);
    }

    let critical_path_length = critical_path.values().copied().max().unwrap_or(0);
    let total_estimated_lines: u64 = plan.tasks.iter().map(|t| u64::from(t.estimated_lines)).sum();
    let max_parallelization = layers.iter().map(Vec::len).max().unwrap_or(0);

    Metrics {
        task_count: plan.tasks.len(),
        execution_layers: layers.len(),
        max_parallelization,
        critical_path_length,
        total_estimated_lines,
        estimated_speedup: total_estimated_lines as f64 / critical_path_length.max(1) as f64,
    }
}
