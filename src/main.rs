use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chopstack::agent::CancellationToken;
use chopstack::config::EngineConfig;
use chopstack::plan::Plan;
use chopstack::scheduler::RunOptions;
use chopstack::stack::OrderStrategy;
use chopstack::vcs::Repository;

#[derive(Parser)]
#[command(name = "chopstack")]
#[command(about = "Decomposes a feature request into file-scoped tasks and runs them in parallel, isolated git worktrees")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan file without running it
    Validate {
        /// Path to the plan file (TOML by default, or JSON if it starts with `{`)
        plan_file: PathBuf,
    },
    /// Run a plan to completion
    Run {
        /// Path to the plan file (TOML by default, or JSON if it starts with `{`)
        plan_file: PathBuf,

        /// Reference to root the run on, overriding the plan's own `base`
        #[arg(long)]
        base: Option<String>,

        /// Schedule and acquire workspaces without invoking the agent or committing
        #[arg(long)]
        dry_run: bool,

        /// Cap concurrent tasks per layer (defaults to available parallelism)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Keep scheduling independent tasks after one fails
        #[arg(long)]
        continue_on_error: bool,

        /// Ordering strategy used when replaying commits into the final stack
        #[arg(long, value_enum, default_value_t = OrderArg::DependencyOrder)]
        order: OrderArg,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OrderArg {
    DependencyOrder,
    ComplexityFirst,
    FileImpact,
}

impl std::fmt::Display for OrderArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DependencyOrder => "dependency-order",
            Self::ComplexityFirst => "complexity-first",
            Self::FileImpact => "file-impact",
        };
        f.write_str(s)
    }
}

impl From<OrderArg> for OrderStrategy {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::DependencyOrder => OrderStrategy::DependencyOrder,
            OrderArg::ComplexityFirst => OrderStrategy::ComplexityFirst,
            OrderArg::FileImpact => OrderStrategy::FileImpact,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }))
    .init();

    let result = match cli.command {
        Commands::Validate { plan_file } => validate_plan(&plan_file),
        Commands::Run {
            plan_file,
            base,
            dry_run,
            max_parallel,
            continue_on_error,
            order,
        } => run_plan(&plan_file, base, dry_run, max_parallel, continue_on_error, order.into()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn load_plan(path: &PathBuf) -> Result<Plan> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read plan file {}", path.display()))?;
    chopstack::plan::parse::parse(&content).context("failed to parse plan")
}

fn validate_plan(plan_file: &PathBuf) -> Result<()> {
    let plan = load_plan(plan_file)?;
    let report = chopstack::validate(&plan);

    println!(
        "{} task(s): {} error(s), {} cycle(s), {} missing dependency(ies), {} conflict(s), {} orphaned task(s)",
        plan.tasks.len(),
        report.errors.len(),
        report.circular_dependencies.len(),
        report.missing_dependencies.len(),
        report.conflicts.len(),
        report.orphaned_tasks.len(),
    );
    for error in &report.errors {
        println!("  error: {error}");
    }
    for missing in &report.missing_dependencies {
        println!("  missing dependency: {} requires {}", missing.task, missing.missing);
    }
    for cycle in &report.circular_dependencies {
        println!("  cycle: {}", cycle.join(" -> "));
    }
    for conflict in &report.conflicts {
        println!("  conflict: {} and {} both write {}", conflict.task_a, conflict.task_b, conflict.path);
    }
    for orphan in &report.orphaned_tasks {
        println!("  orphaned task (advisory): {orphan}");
    }

    if !report.valid() {
        process::exit(1);
    }

    let layers = chopstack::dag::layers(&plan);
    let metrics = chopstack::dag::metrics(&plan, &layers);
    println!(
        "{} layer(s), max parallelism {}, critical path {} line(s), estimated speedup {:.2}x",
        metrics.execution_layers, metrics.max_parallelization, metrics.critical_path_length, metrics.estimated_speedup
    );

    Ok(())
}

fn run_plan(
    plan_file: &PathBuf,
    base: Option<String>,
    dry_run: bool,
    max_parallel: Option<usize>,
    continue_on_error: bool,
    strategy: OrderStrategy,
) -> Result<()> {
    let plan = load_plan(plan_file)?;

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let host = Repository::open(&cwd).context("failed to open host repository")?;

    let mut config = EngineConfig::load(host.root())?;
    if let Some(max_parallel) = max_parallel {
        config.max_parallel_tasks = Some(max_parallel);
    }
    if continue_on_error {
        config.continue_on_error = true;
    }

    let base_ref = base.unwrap_or_else(|| plan.base.clone());
    let options = RunOptions { base_ref, dry_run };
    let cancellation = CancellationToken::new();

    let report = chopstack::execute(plan, config, host, options, strategy, cancellation).context("run failed")?;

    print_run_summary(&report);

    if !report.run.failed.is_empty() || !report.run.blocked.is_empty() {
        process::exit(1);
    }
    Ok(())
}

fn print_run_summary(report: &chopstack::ExecutionReport) {
    println!(
        "{} completed, {} failed, {} blocked, {} skipped ({:?})",
        report.run.completed.len(),
        report.run.failed.len(),
        report.run.blocked.len(),
        report.run.skipped.len(),
        report.run.duration,
    );
    for id in &report.run.failed {
        let exec = &report.run.tasks[id];
        let reason = exec.history.last().and_then(|h| h.reason.clone()).unwrap_or_default();
        println!("  failed: {id}: {reason}");
    }

    match &report.stack {
        Some(branches) if !branches.is_empty() => {
            println!("stack ({} branch(es)):", branches.len());
            for branch in branches {
                println!("  {} <- {} ({})", branch.branch_name, branch.parent_branch, branch.commit_id);
            }
        }
        _ => println!("no stack assembled"),
    }

    for url in &report.submitted_urls {
        println!("review: {url}");
    }
}
