//! Engine-wide error taxonomy.

use std::fmt;

/// Errors raised by the VCS primitive.
///
/// Kept separate from [`EngineError`] because the VCS layer has no concept of
/// tasks, plans, or scheduling; it only knows about repositories, worktrees,
/// and git subprocess failures.
#[derive(Debug)]
pub enum VcsError {
    /// A `git` invocation exited non-zero. `command` is the argv joined with
    /// spaces; `message` is stderr+stdout trimmed and joined.
    CommandFailed { command: String, message: String },
    /// Output from `git` could not be parsed into the expected shape.
    ParseError { what: String, detail: String },
    /// A worktree was expected at `path` but none was found.
    WorktreeMissing { path: String },
    /// `git worktree add` failed because the target path already exists.
    WorktreePathExists { path: String },
    /// A branch name collided with an existing ref.
    BranchAlreadyExists { branch: String },
    /// A cherry-pick left the working tree with unmerged paths.
    Conflict { paths: Vec<String> },
    /// Any other I/O failure spawning or reading from the git process.
    Io(std::io::Error),
}

impl fmt::Display for VcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed { command, message } => {
                write!(f, "git {command} failed: {message}")
            }
            Self::ParseError { what, detail } => write!(f, "failed to parse {what}: {detail}"),
            Self::WorktreeMissing { path } => write!(f, "no worktree at {path}"),
            Self::WorktreePathExists { path } => {
                write!(f, "worktree path already exists: {path}")
            }
            Self::BranchAlreadyExists { branch } => {
                write!(f, "branch already exists: {branch}")
            }
            Self::Conflict { paths } => {
                write!(f, "conflict in: {}", paths.join(", "))
            }
            Self::Io(err) => write!(f, "git process error: {err}"),
        }
    }
}

impl std::error::Error for VcsError {}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// The single error type returned from the library's public APIs.
///
/// One variant per failure mode named by the task model, not per
/// implementation detail — callers match on these to decide retry/abort
/// behavior without needing to know which subsystem raised them.
#[derive(Debug)]
pub enum EngineError {
    /// A plan failed structural or semantic validation (bad dependency ref,
    /// cycle, or a write-conflict between tasks with no dependency edge).
    PlanInvalid { reason: String },
    /// The configured agent command could not be located or spawned.
    AgentNotAvailable { command: String, detail: String },
    /// The agent process ran but exited with a non-zero status.
    AgentFailure {
        task_id: String,
        exit_code: Option<i32>,
        detail: String,
    },
    /// A task's agent invocation exceeded its configured timeout.
    Timeout { task_id: String, seconds: u64 },
    /// The agent produced no tracked changes to commit for a task.
    NothingToCommit { task_id: String },
    /// Worktree/branch setup or teardown failed.
    WorkspaceError { detail: String },
    /// Cherry-picking a task's commit onto the stack produced a conflict.
    StackConflict { branch: String, detail: String },
    /// The run was cancelled before all tasks completed.
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlanInvalid { reason } => write!(f, "plan invalid: {reason}"),
            Self::AgentNotAvailable { command, detail } => {
                write!(f, "agent command '{command}' not available: {detail}")
            }
            Self::AgentFailure {
                task_id,
                exit_code,
                detail,
            } => match exit_code {
                Some(code) => write!(f, "task {task_id} agent failed (exit {code}): {detail}"),
                None => write!(f, "task {task_id} agent failed: {detail}"),
            },
            Self::Timeout { task_id, seconds } => {
                write!(f, "task {task_id} timed out after {seconds}s")
            }
            Self::NothingToCommit { task_id } => {
                write!(f, "task {task_id} produced nothing to commit")
            }
            Self::WorkspaceError { detail } => write!(f, "workspace error: {detail}"),
            Self::StackConflict { branch, detail } => {
                write!(f, "conflict assembling branch {branch}: {detail}")
            }
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<VcsError> for EngineError {
    fn from(err: VcsError) -> Self {
        Self::WorkspaceError {
            detail: err.to_string(),
        }
    }
}
