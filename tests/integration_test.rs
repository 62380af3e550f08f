//! End-to-end coverage exercising the plan parser, DAG validator, scheduler,
//! and stack assembler together against real temporary git repositories.

use std::fs;
use std::path::Path;
use std::process::Command;

use chopstack::agent::CancellationToken;
use chopstack::config::EngineConfig;
use chopstack::dag;
use chopstack::plan::parse::parse_human;
use chopstack::plan::Plan;
use chopstack::scheduler::RunOptions;
use chopstack::stack::OrderStrategy;
use chopstack::vcs::Repository;

struct TestRepo {
    dir: tempfile::TempDir,
    repo: Repository,
}

impl TestRepo {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        repo.stage_all().unwrap();
        repo.commit("initial", false).unwrap();

        // Every test repo needs a `main` the plans can root on; `git init`
        // may have left the branch named `master` depending on host config.
        Command::new("git")
            .args(["branch", "-M", "main"])
            .current_dir(dir.path())
            .output()
            .unwrap();

        Self { dir, repo }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// A plan whose agent is a shell one-liner: the `agentPrompt` field carries a
/// shell script run by the fake agent binary (`sh -c`), which this fixture
/// points the engine's `agent.command` at directly.
fn shell_agent_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.agent.command = "sh".to_string();
    config.agent.args = vec!["-c".to_string()];
    config.cleanup_on_failure = true;
    config
}

const TWO_INDEPENDENT_TASKS: &str = r#"
base = "main"

[[tasks]]
id = "a"
title = "Add A"
description = "Create a.txt"
writes = ["a.txt"]
requires = []
estimatedLines = 5
agentPrompt = "echo from-a > a.txt"

[[tasks]]
id = "b"
title = "Add B"
description = "Create b.txt"
writes = ["b.txt"]
requires = []
estimatedLines = 5
agentPrompt = "echo from-b > b.txt"
"#;

const DEPENDENT_TASKS: &str = r#"
base = "main"

[[tasks]]
id = "a"
title = "Add A"
description = "Create a.txt"
writes = ["a.txt"]
requires = []
estimatedLines = 5
agentPrompt = "echo from-a > a.txt"

[[tasks]]
id = "b"
title = "Add B, depends on A"
description = "Create b.txt"
writes = ["b.txt"]
requires = ["a"]
estimatedLines = 5
agentPrompt = "echo from-b > b.txt"
"#;

#[test]
fn validates_and_runs_two_independent_tasks_to_a_stack() {
    let test_repo = TestRepo::new();
    let plan = parse_human(TWO_INDEPENDENT_TASKS).unwrap();

    let report = dag::validate(&plan);
    assert!(report.valid(), "plan should validate: {report:?}");

    let layers = dag::layers(&plan);
    assert_eq!(layers, vec![vec!["a".to_string(), "b".to_string()]]);

    let mut config = shell_agent_config();
    config.shadow_dir = ".chopstack/shadows".to_string();
    config.branch_prefix = "chopstack/".to_string();

    let options = RunOptions {
        base_ref: "main".to_string(),
        dry_run: false,
    };

    let report = chopstack::execute(
        plan,
        config,
        test_repo.repo.clone(),
        options,
        OrderStrategy::DependencyOrder,
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.run.completed.len(), 2);
    assert!(report.run.failed.is_empty());

    let stack = report.stack.expect("two completed tasks should assemble a stack");
    assert_eq!(stack.len(), 2);

    let branch_a = stack.iter().find(|b| b.task_id == "a").unwrap();
    let branch_b = stack.iter().find(|b| b.task_id == "b").unwrap();
    assert_eq!(branch_a.branch_name, "chopstack/a");
    assert_eq!(branch_b.branch_name, "chopstack/b");
    // Independent tasks both root on the base ref, not on each other.
    assert_eq!(branch_a.parent_branch, "main");
    assert_eq!(branch_b.parent_branch, "main");

    // Both branches actually exist in the host repo with the file the fake
    // agent wrote, checked into their own commit.
    assert!(test_repo.repo.branch_exists("chopstack/a"));
    assert!(test_repo.repo.branch_exists("chopstack/b"));
    test_repo.repo.checkout("chopstack/a").unwrap();
    assert_eq!(fs::read_to_string(test_repo.path().join("a.txt")).unwrap().trim(), "from-a");
    test_repo.repo.checkout("chopstack/b").unwrap();
    assert_eq!(fs::read_to_string(test_repo.path().join("b.txt")).unwrap().trim(), "from-b");
}

#[test]
fn dependent_task_stacks_onto_its_dependencys_branch() {
    let test_repo = TestRepo::new();
    let plan = parse_human(DEPENDENT_TASKS).unwrap();
    assert!(dag::validate(&plan).valid());

    let config = shell_agent_config();
    let options = RunOptions {
        base_ref: "main".to_string(),
        dry_run: false,
    };

    let report = chopstack::execute(
        plan,
        config,
        test_repo.repo.clone(),
        options,
        OrderStrategy::DependencyOrder,
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.run.completed.len(), 2);
    let stack = report.stack.unwrap();
    let branch_b = stack.iter().find(|b| b.task_id == "b").unwrap();
    assert_eq!(branch_b.parent_branch, "chopstack/a");

    // `b`'s branch contains both files since it's stacked on top of `a`.
    test_repo.repo.checkout("chopstack/b").unwrap();
    assert!(test_repo.path().join("a.txt").exists());
    assert!(test_repo.path().join("b.txt").exists());
}

#[test]
fn dry_run_skips_workspace_release_and_stack_assembly() {
    let test_repo = TestRepo::new();
    let plan = parse_human(TWO_INDEPENDENT_TASKS).unwrap();

    let config = shell_agent_config();
    let options = RunOptions {
        base_ref: "main".to_string(),
        dry_run: true,
    };

    let report = chopstack::execute(
        plan,
        config,
        test_repo.repo.clone(),
        options,
        OrderStrategy::DependencyOrder,
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.run.completed.len(), 2);
    assert!(report.stack.is_none());
    assert!(!test_repo.repo.branch_exists("chopstack/a"));
}

#[test]
fn validate_rejects_plan_with_conflicting_writes() {
    let toml = r#"
        base = "main"

        [[tasks]]
        id = "a"
        title = "Add A"
        description = "A"
        writes = ["src/lib.rs"]
        requires = []
        estimatedLines = 5
        agentPrompt = "noop"

        [[tasks]]
        id = "b"
        title = "Add B"
        description = "B"
        writes = ["./src/lib.rs"]
        requires = []
        estimatedLines = 5
        agentPrompt = "noop"
    "#;
    let plan: Plan = parse_human(toml).unwrap();

    let report = dag::validate(&plan);
    assert!(!report.valid());
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].task_a, "a");
    assert_eq!(report.conflicts[0].task_b, "b");
}

#[test]
fn validate_rejects_circular_dependencies() {
    let toml = r#"
        base = "main"

        [[tasks]]
        id = "a"
        title = "Add A"
        description = "A"
        writes = ["a.txt"]
        requires = ["b"]
        estimatedLines = 5
        agentPrompt = "noop"

        [[tasks]]
        id = "b"
        title = "Add B"
        description = "B"
        writes = ["b.txt"]
        requires = ["a"]
        estimatedLines = 5
        agentPrompt = "noop"
    "#;
    let plan: Plan = parse_human(toml).unwrap();

    let report = dag::validate(&plan);
    assert!(!report.valid());
    assert_eq!(report.circular_dependencies.len(), 1);
}

#[test]
fn failing_task_blocks_its_dependent() {
    let test_repo = TestRepo::new();
    let toml = r#"
        base = "main"

        [[tasks]]
        id = "a"
        title = "Add A"
        description = "A"
        writes = ["a.txt"]
        requires = []
        estimatedLines = 5
        agentPrompt = "exit 1"

        [[tasks]]
        id = "b"
        title = "Add B"
        description = "B"
        writes = ["b.txt"]
        requires = ["a"]
        estimatedLines = 5
        agentPrompt = "echo from-b > b.txt"
    "#;
    let plan: Plan = parse_human(toml).unwrap();
    assert!(dag::validate(&plan).valid());

    let mut config = shell_agent_config();
    config.max_retries = 0;
    let options = RunOptions {
        base_ref: "main".to_string(),
        dry_run: false,
    };

    let report = chopstack::execute(
        plan,
        config,
        test_repo.repo.clone(),
        options,
        OrderStrategy::DependencyOrder,
        CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(report.run.failed, vec!["a".to_string()]);
    assert_eq!(report.run.blocked, vec!["b".to_string()]);
    // Workspace branches survive a failed run so the caller can inspect them.
    assert!(report.stack.is_none());
}

#[test]
fn metrics_report_layer_and_size_totals() {
    let plan = parse_human(TWO_INDEPENDENT_TASKS).unwrap();
    let layers = dag::layers(&plan);
    let metrics = dag::metrics(&plan, &layers);

    assert_eq!(metrics.task_count, 2);
    assert_eq!(metrics.execution_layers, 1);
    assert_eq!(metrics.max_parallelization, 2);
    assert_eq!(metrics.total_estimated_lines, 10);
}

#[test]
fn complexity_first_order_runs_smallest_task_first_in_the_stack() {
    let test_repo = TestRepo::new();
    let toml = r#"
        base = "main"

        [[tasks]]
        id = "big"
        title = "Big task"
        description = "A"
        writes = ["big.txt"]
        requires = []
        estimatedLines = 500
        agentPrompt = "echo big > big.txt"

        [[tasks]]
        id = "small"
        title = "Small task"
        description = "B"
        writes = ["small.txt"]
        requires = []
        estimatedLines = 5
        agentPrompt = "echo small > small.txt"
    "#;
    let plan: Plan = parse_human(toml).unwrap();
    assert!(dag::validate(&plan).valid());

    let config = shell_agent_config();
    let options = RunOptions {
        base_ref: "main".to_string(),
        dry_run: false,
    };

    let report = chopstack::execute(
        plan,
        config,
        test_repo.repo.clone(),
        options,
        OrderStrategy::ComplexityFirst,
        CancellationToken::new(),
    )
    .unwrap();

    let stack = report.stack.unwrap();
    assert_eq!(stack[0].task_id, "small");
    assert_eq!(stack[1].task_id, "big");
}
