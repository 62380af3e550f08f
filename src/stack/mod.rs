//! Replays each completed task's workspace commit onto a linear stack of
//! branches on the host repository, in dependency order by default.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, VcsError};
use crate::plan::Plan;
use crate::scheduler::ExecutionTask;
use crate::vcs::Repository;

/// One branch in the assembled stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBranch {
    pub task_id: String,
    pub branch_name: String,
    pub parent_branch: String,
    pub commit_id: String,
}

/// Strategy for ordering completed tasks before replay. Only
/// `DependencyOrder` is guaranteed valid when tasks have real dependency
/// edges; the other two are only meaningful for edge-free plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStrategy {
    #[default]
    DependencyOrder,
    ComplexityFirst,
    FileImpact,
}

/// Confirm every completed task's commit is reachable from the host
/// repository. Tasks run in worktrees share the host's object database, so
/// this should always hold; it exists as a guard against a workspace having
/// been torn down or rewritten out from under the run.
pub fn preflight(host: &Repository, completed: &[&ExecutionTask]) -> Result<(), EngineError> {
    for task in completed {
        let Some(commit_id) = &task.commit_id else {
            continue;
        };
        if !host.commit_exists(commit_id) {
            return Err(EngineError::StackConflict {
                branch: task.task.id.clone(),
                detail: format!("commit {commit_id} is not reachable from the host repository"),
            });
        }
    }
    Ok(())
}

/// Order `completed` task ids per `strategy`.
pub fn order_tasks(plan: &Plan, completed: &HashMap<String, ExecutionTask>, strategy: OrderStrategy) -> Vec<String> {
    let ids: Vec<&str> = plan
        .tasks
        .iter()
        .map(|t| t.id.as_str())
        .filter(|id| completed.contains_key(*id))
        .collect();

    match strategy {
        OrderStrategy::DependencyOrder => dependency_order(plan, &ids),
        OrderStrategy::ComplexityFirst => {
            let mut ordered = ids.to_vec();
            ordered.sort_by(|a, b| {
                let ta = plan.task(a).expect("id came from plan");
                let tb = plan.task(b).expect("id came from plan");
                ta.estimated_lines.cmp(&tb.estimated_lines).then_with(|| ta.id.cmp(&tb.id))
            });
            ordered.into_iter().map(String::from).collect()
        }
        OrderStrategy::FileImpact => {
            let mut ordered = ids.to_vec();
            ordered.sort_by(|a, b| {
                let ta = plan.task(a).expect("id came from plan");
                let tb = plan.task(b).expect("id came from plan");
                let impact = |t: &crate::plan::Task| t.writes.len() + t.reads.len();
                impact(ta).cmp(&impact(tb)).then_with(|| ta.id.cmp(&tb.id))
            });
            ordered.into_iter().map(String::from).collect()
        }
    }
}

/// Depth-first traversal placing each task after its dependencies, otherwise
/// preserving the plan's original task order among independent siblings.
fn dependency_order(plan: &Plan, ids: &[&str]) -> Vec<String> {
    let eligible: std::collections::HashSet<&str> = ids.iter().copied().collect();
    let mut visited = std::collections::HashSet::new();
    let mut ordered = Vec::with_capacity(ids.len());

    fn visit<'a>(
        id: &'a str,
        plan: &'a Plan,
        eligible: &std::collections::HashSet<&'a str>,
        visited: &mut std::collections::HashSet<&'a str>,
        ordered: &mut Vec<String>,
    ) {
        if visited.contains(id) {
            return;
        }
        visited.insert(id);
        if let Some(task) = plan.task(id) {
            for dep in &task.requires {
                if eligible.contains(dep.as_str()) {
                    visit(dep, plan, eligible, visited, ordered);
                }
            }
        }
        ordered.push(id.to_string());
    }

    for id in ids {
        visit(id, plan, &eligible, &mut visited, &mut ordered);
    }
    ordered
}

/// Replay each completed task's commit onto its own branch, rooted (directly
/// or transitively) at `parent_ref`.
pub fn assemble(
    host: &Repository,
    plan: &Plan,
    completed: &HashMap<String, ExecutionTask>,
    parent_ref: &str,
    branch_prefix: &str,
    strategy: OrderStrategy,
) -> Result<Vec<StackBranch>, EngineError> {
    let refs: Vec<&ExecutionTask> = completed.values().collect();
    preflight(host, &refs)?;

    let order = order_tasks(plan, completed, strategy);
    let mut branch_of: HashMap<String, String> = HashMap::new();
    // Position each dependency was assembled at, so "most recently added
    // dependency" can be picked when a task requires more than one.
    let mut assembled_at: HashMap<String, usize> = HashMap::new();
    let mut stack = Vec::with_capacity(order.len());

    for (position, task_id) in order.into_iter().enumerate() {
        let exec = &completed[&task_id];
        let task = plan.task(&task_id).expect("id came from plan");
        let commit_id = exec
            .commit_id
            .clone()
            .ok_or_else(|| EngineError::StackConflict {
                branch: task_id.clone(),
                detail: "completed task has no commit to replay".to_string(),
            })?;

        let parent_branch = task
            .requires
            .iter()
            .filter_map(|dep| branch_of.get(dep).map(|b| (assembled_at[dep], b)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, branch)| branch.clone())
            .unwrap_or_else(|| parent_ref.to_string());

        let branch_name = unique_branch_name(host, branch_prefix, &task_id);

        host.checkout(&parent_branch)?;
        host.create_branch(&branch_name, &parent_branch)?;
        host.checkout(&branch_name)?;

        if let Err(e) = host.cherry_pick(&commit_id) {
            let detail = match e {
                VcsError::Conflict { paths } => format!(
                    "cherry-pick onto {branch_name} (parent {parent_branch}) conflicted in: {}",
                    paths.join(", ")
                ),
                other => other.to_string(),
            };
            return Err(EngineError::StackConflict {
                branch: branch_name,
                detail,
            });
        }

        let final_commit = host.current_commit()?;
        branch_of.insert(task_id.clone(), branch_name.clone());
        assembled_at.insert(task_id.clone(), position);
        stack.push(StackBranch {
            task_id,
            branch_name,
            parent_branch,
            commit_id: final_commit,
        });
    }

    Ok(stack)
}

/// Pick a branch name, suffixing with a timestamp if `prefix + taskId` is
/// already taken (mirrors the workspace manager's collision policy).
fn unique_branch_name(host: &Repository, prefix: &str, task_id: &str) -> String {
    let candidate = format!("{prefix}{task_id}");
    if !host.branch_exists(&candidate) {
        return candidate;
    }
    format!("{candidate}-{}", chrono::Utc::now().timestamp_millis())
}

/// Invoke the configured stack-submission command and scan its output for
/// review URLs. Failure is reported to the caller but never undoes the
/// already-assembled stack.
pub fn submit(command: &str, args: &[String], stack: &[StackBranch]) -> Result<Vec<String>, String> {
    let branch_list = stack.iter().map(|b| b.branch_name.clone()).collect::<Vec<_>>().join("\n");

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn submission command: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(branch_list.as_bytes());
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("submission command I/O error: {e}"))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(scan_urls(&text))
}

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").expect("static regex is valid"));

fn scan_urls(text: &str) -> Vec<String> {
    URL_PATTERN.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Task;
    use std::fs;

    fn task(id: &str, requires: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: "d".to_string(),
            writes: vec![format!("{id}.txt")],
            reads: vec![],
            requires: requires.iter().map(|s| s.to_string()).collect(),
            estimated_lines: 5,
            agent_prompt: "p".to_string(),
        }
    }

    fn exec_task(task: Task, commit_id: &str) -> ExecutionTask {
        ExecutionTask {
            task,
            state: crate::scheduler::TaskState::Completed,
            history: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            started_at: None,
            ended_at: None,
            commit_id: Some(commit_id.to_string()),
            exit_code: Some(0),
            output: String::new(),
            workspace_path: None,
        }
    }

    fn init_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        repo.stage_all().unwrap();
        repo.commit("initial", false).unwrap();
        repo.checkout("main").unwrap();
        (dir, repo)
    }

    #[test]
    fn dependency_order_places_dependencies_before_dependents() {
        let plan = Plan {
            tasks: vec![task("a", &[]), task("b", &["a"]), task("c", &[])],
            base: "main".to_string(),
        };
        let mut completed = HashMap::new();
        completed.insert("a".to_string(), exec_task(task("a", &[]), "x"));
        completed.insert("b".to_string(), exec_task(task("b", &["a"]), "y"));
        completed.insert("c".to_string(), exec_task(task("c", &[]), "z"));

        let order = order_tasks(&plan, &completed, OrderStrategy::DependencyOrder);
        let pos_a = order.iter().position(|id| id == "a").unwrap();
        let pos_b = order.iter().position(|id| id == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn complexity_first_orders_by_estimated_size() {
        let plan = Plan {
            tasks: vec![
                Task { estimated_lines: 40, ..task("a", &[]) },
                Task { estimated_lines: 5, ..task("b", &[]) },
            ],
            base: "main".to_string(),
        };
        let mut completed = HashMap::new();
        completed.insert("a".to_string(), exec_task(plan.tasks[0].clone(), "x"));
        completed.insert("b".to_string(), exec_task(plan.tasks[1].clone(), "y"));

        let order = order_tasks(&plan, &completed, OrderStrategy::ComplexityFirst);
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn assembles_independent_tasks_onto_trunk() {
        let (dir, repo) = init_repo();
        let base = repo.current_commit().unwrap();

        repo.create_branch("work-a", &base).unwrap();
        repo.checkout("work-a").unwrap();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        repo.stage_all().unwrap();
        let commit_a = repo.commit("a work", false).unwrap();

        repo.checkout("main").unwrap();
        repo.create_branch("work-b", &base).unwrap();
        repo.checkout("work-b").unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        repo.stage_all().unwrap();
        let commit_b = repo.commit("b work", false).unwrap();

        repo.checkout("main").unwrap();

        let plan = Plan {
            tasks: vec![task("a", &[]), task("b", &[])],
            base: "main".to_string(),
        };
        let mut completed = HashMap::new();
        completed.insert("a".to_string(), exec_task(task("a", &[]), &commit_a));
        completed.insert("b".to_string(), exec_task(task("b", &[]), &commit_b));

        let stack = assemble(&repo, &plan, &completed, "main", "chopstack/", OrderStrategy::DependencyOrder).unwrap();

        assert_eq!(stack.len(), 2);
        assert!(stack.iter().all(|b| b.parent_branch == "main"));
        assert!(stack.iter().any(|b| b.branch_name == "chopstack/a"));
        assert!(stack.iter().any(|b| b.branch_name == "chopstack/b"));
    }

    #[test]
    fn conflicting_cherry_pick_surfaces_stack_conflict() {
        let (dir, repo) = init_repo();
        let base = repo.current_commit().unwrap();

        fs::write(dir.path().join("README.md"), "main change\n").unwrap();
        repo.stage_all().unwrap();
        repo.commit("main change", false).unwrap();

        repo.create_branch("work-a", &base).unwrap();
        repo.checkout("work-a").unwrap();
        fs::write(dir.path().join("README.md"), "side change\n").unwrap();
        repo.stage_all().unwrap();
        let commit_a = repo.commit("side change", false).unwrap();

        repo.checkout("main").unwrap();

        let plan = Plan {
            tasks: vec![task("a", &[])],
            base: "main".to_string(),
        };
        let mut completed = HashMap::new();
        completed.insert("a".to_string(), exec_task(task("a", &[]), &commit_a));

        let err = assemble(&repo, &plan, &completed, "main", "chopstack/", OrderStrategy::DependencyOrder).unwrap_err();
        assert!(matches!(err, EngineError::StackConflict { .. }));
    }

    #[test]
    fn scan_urls_extracts_http_links() {
        let text = "Opened review: https://example.com/pr/42 please take a look";
        let urls = scan_urls(text);
        assert_eq!(urls, vec!["https://example.com/pr/42".to_string()]);
    }
}
