//! chopstack: decomposes a feature request into file-scoped tasks, validates
//! the decomposition as a DAG, executes it layer by layer in isolated git
//! worktrees via an external coding agent, and replays the results as a
//! stack of branches on the host repository.

pub mod agent;
pub mod commit_gen;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod path;
pub mod plan;
pub mod scheduler;
pub mod shell_exec;
pub mod stack;
pub mod vcs;
pub mod workspace;

pub use error::{EngineError, VcsError};

use std::collections::HashMap;

use crate::agent::CancellationToken;
use crate::config::EngineConfig;
use crate::dag::ValidationReport;
use crate::events::EventBus;
use crate::plan::Plan;
use crate::scheduler::{ExecutionTask, RunOptions, RunResult, Scheduler};
use crate::stack::{OrderStrategy, StackBranch};
use crate::vcs::Repository;
use crate::workspace::WorkspaceManager;

/// Outcome of driving a plan through validation, scheduling, and (unless
/// skipped) stack assembly.
#[derive(Debug)]
pub struct ExecutionReport {
    pub run: RunResult,
    /// `None` on a dry run, a cancelled run, or a run with nothing completed.
    pub stack: Option<Vec<StackBranch>>,
    /// Review URLs scraped from the submission command's output, if
    /// submission was configured and ran.
    pub submitted_urls: Vec<String>,
}

/// Validate `plan` without running anything.
pub fn validate(plan: &Plan) -> ValidationReport {
    dag::validate(plan)
}

/// Drive a plan to completion: validate, schedule tasks against isolated
/// worktrees, and — unless this was a dry run, the run was cancelled, or
/// nothing completed — assemble the completed commits into a stack of
/// branches on `host`.
pub fn execute(
    plan: Plan,
    config: EngineConfig,
    host: Repository,
    options: RunOptions,
    strategy: OrderStrategy,
    cancellation: CancellationToken,
) -> Result<ExecutionReport, EngineError> {
    let report = dag::validate(&plan);
    if !report.valid() {
        return Err(EngineError::PlanInvalid {
            reason: describe_validation_failure(&report),
        });
    }

    let shadow_dir = config.shadow_dir(host.root());
    let workspace = WorkspaceManager::new(host.clone(), shadow_dir, config.branch_prefix.clone());
    let (events, _receiver) = EventBus::new();

    let scheduler = Scheduler::new(plan.clone(), config.clone(), workspace.clone(), events, cancellation);
    let run = scheduler.run(&options);

    let skip_cleanup = !run.failed.is_empty() && !config.cleanup_on_failure;
    if !skip_cleanup {
        // Workspace branches are scratch: drop them now so the stack
        // assembler can claim the same `prefix + taskId` names for the
        // branches it actually hands back to the caller.
        workspace.release_all(false);
    }

    let stack = if options.dry_run || run.cancelled || skip_cleanup {
        None
    } else {
        let completed: HashMap<String, ExecutionTask> = run
            .tasks
            .iter()
            .filter(|(id, _)| run.completed.contains(id))
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();

        if completed.is_empty() {
            None
        } else {
            Some(stack::assemble(
                &host,
                &plan,
                &completed,
                &options.base_ref,
                &config.branch_prefix,
                strategy,
            )?)
        }
    };

    let submitted_urls = match (&stack, &config.submit_command) {
        (Some(branches), Some(command)) if !branches.is_empty() => {
            match stack::submit(command, &config.submit_args, branches) {
                Ok(urls) => urls,
                Err(e) => {
                    log::warn!("stack submission failed: {e}");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };

    Ok(ExecutionReport {
        run,
        stack,
        submitted_urls,
    })
}

fn describe_validation_failure(report: &ValidationReport) -> String {
    let mut parts = Vec::new();
    if !report.errors.is_empty() {
        parts.push(format!("{} structural error(s)", report.errors.len()));
    }
    if !report.missing_dependencies.is_empty() {
        parts.push(format!("{} missing dependency(ies)", report.missing_dependencies.len()));
    }
    if !report.circular_dependencies.is_empty() {
        parts.push(format!("{} cycle(s)", report.circular_dependencies.len()));
    }
    if !report.conflicts.is_empty() {
        parts.push(format!("{} write conflict(s)", report.conflicts.len()));
    }
    if parts.is_empty() {
        "plan failed validation".to_string()
    } else {
        parts.join(", ")
    }
}
