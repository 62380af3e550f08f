//! Thin wrapper over the `git` CLI: the only place in the crate that shells
//! out to version control.
//!
//! Every operation here mirrors a single git invocation and returns
//! `Result<_, VcsError>` with stderr+stdout trimmed and joined on failure,
//! the same shape used throughout this crate's subprocess callers.

mod parse;

use std::path::{Path, PathBuf};

use crate::error::VcsError;
use crate::shell_exec::Cmd;

/// A single entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Line-level diff totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub files: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.files == 0
    }
}

/// A handle to a git repository (or worktree within one), cheap to clone.
#[derive(Debug, Clone)]
pub struct Repository {
    /// Working directory every `git` invocation runs in.
    root: PathBuf,
}

impl Repository {
    /// Open the repository containing `path`, resolving it to the working
    /// tree's top-level directory.
    pub fn open(path: &Path) -> Result<Self, VcsError> {
        let repo = Self {
            root: path.to_path_buf(),
        };
        let toplevel = repo.run_command(&["rev-parse", "--show-toplevel"])?;
        let root = crate::path::canonicalize(Path::new(toplevel.trim())).map_err(VcsError::Io)?;
        Ok(Self { root })
    }

    /// Construct a handle without validating `path` is a git repository.
    /// Used for worktree paths the engine just created, where validation
    /// would be redundant.
    pub fn at(path: &Path) -> Self {
        Self {
            root: path.to_path_buf(),
        }
    }

    /// Initialize a new repository at `path` with a committer identity set,
    /// for use by test fixtures that need a real git repository on disk.
    pub fn init(path: &Path) -> Result<Self, VcsError> {
        let repo = Self::at(path);
        repo.run_command(&["init", "-q", "-b", "main"])?;
        repo.run_command(&["config", "user.email", "test@example.com"])?;
        repo.run_command(&["config", "user.name", "Test"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_command(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.root)
            .context(crate::path::display_name(&self.root))
            .run()
            .map_err(VcsError::Io)?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: args.join(" "),
                message: join_output(&output),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command without treating non-zero exit as an error, for
    /// callers that need to inspect the exit code directly (e.g.
    /// `has_staged_changes`, conflict detection on cherry-pick).
    fn run_command_raw(&self, args: &[&str]) -> Result<std::process::Output, VcsError> {
        Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.root)
            .context(crate::path::display_name(&self.root))
            .run()
            .map_err(VcsError::Io)
    }

    /// Stage the given paths (relative to the repository root).
    pub fn stage(&self, paths: &[impl AsRef<str>]) -> Result<(), VcsError> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(AsRef::as_ref));
        self.run_command(&args)?;
        Ok(())
    }

    /// Stage every tracked and untracked change (`git add -A`).
    pub fn stage_all(&self) -> Result<(), VcsError> {
        self.run_command(&["add", "-A"])?;
        Ok(())
    }

    /// Whether the index currently has staged changes.
    pub fn has_staged_changes(&self) -> Result<bool, VcsError> {
        let output = self.run_command_raw(&["diff", "--cached", "--quiet", "--exit-code"])?;
        Ok(!output.status.success())
    }

    /// Commit the currently staged changes, returning the new commit SHA.
    /// Set `allow_empty` to commit even when nothing is staged (used when a
    /// task's only diff is whitespace and the caller opted in).
    pub fn commit(&self, message: &str, allow_empty: bool) -> Result<String, VcsError> {
        let mut args = vec!["commit", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run_command(&args)?;
        self.current_commit()
    }

    /// Porcelain status lines (`git status --porcelain`), one per changed path.
    pub fn status(&self) -> Result<Vec<String>, VcsError> {
        let stdout = self.run_command(&["status", "--porcelain"])?;
        Ok(stdout.lines().map(String::from).collect())
    }

    /// Whether the working tree (staged or unstaged) differs from HEAD.
    pub fn is_dirty(&self) -> Result<bool, VcsError> {
        Ok(!self.status()?.is_empty())
    }

    /// The SHA of the commit currently checked out.
    pub fn current_commit(&self) -> Result<String, VcsError> {
        Ok(self.run_command(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Check out an existing branch or ref.
    pub fn checkout(&self, branch_or_ref: &str) -> Result<(), VcsError> {
        self.run_command(&["checkout", branch_or_ref])?;
        Ok(())
    }

    /// Create a new branch at `start_point` without checking it out.
    pub fn create_branch(&self, name: &str, start_point: &str) -> Result<(), VcsError> {
        let output = self.run_command_raw(&["branch", name, start_point])?;
        if !output.status.success() {
            let message = join_output(&output);
            if message.contains("already exists") {
                return Err(VcsError::BranchAlreadyExists {
                    branch: name.to_string(),
                });
            }
            return Err(VcsError::CommandFailed {
                command: format!("branch {name} {start_point}"),
                message,
            });
        }
        Ok(())
    }

    /// Create a worktree at `path` on a new branch `branch`, starting from
    /// `start_point`.
    pub fn create_worktree(
        &self,
        path: &Path,
        branch: &str,
        start_point: &str,
    ) -> Result<Repository, VcsError> {
        let path_str = path.to_string_lossy().into_owned();
        let output = self.run_command_raw(&[
            "worktree",
            "add",
            "-b",
            branch,
            &path_str,
            start_point,
        ])?;
        if !output.status.success() {
            let message = join_output(&output);
            if message.contains("already exists") {
                return Err(VcsError::WorktreePathExists {
                    path: path_str,
                });
            }
            return Err(VcsError::CommandFailed {
                command: format!("worktree add -b {branch} {path_str} {start_point}"),
                message,
            });
        }
        Ok(Repository::at(path))
    }

    /// Remove a worktree. `force` discards any uncommitted changes in it.
    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_command(&args)?;
        Ok(())
    }

    /// Whether a local branch with this name exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        let refname = format!("refs/heads/{name}");
        self.run_command_raw(&["rev-parse", "--verify", "--quiet", &refname])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Whether `commit` is present in this repository's object database.
    pub fn commit_exists(&self, commit: &str) -> bool {
        let object = format!("{commit}^{{commit}}");
        self.run_command_raw(&["cat-file", "-e", &object])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Delete a local branch.
    pub fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        self.run_command(&["branch", "-D", name])?;
        Ok(())
    }

    /// List all worktrees known to this repository.
    pub fn list_worktrees(&self) -> Result<Vec<Worktree>, VcsError> {
        let stdout = self.run_command(&["worktree", "list", "--porcelain"])?;
        Worktree::parse_porcelain_list(&stdout)
    }

    /// Cherry-pick a single commit onto the currently checked-out branch.
    /// On conflict, aborts the cherry-pick so the worktree is left clean and
    /// returns `VcsError::Conflict` naming the unmerged paths; any other
    /// failure (e.g. nothing to commit) is `VcsError::CommandFailed`.
    pub fn cherry_pick(&self, commit: &str) -> Result<(), VcsError> {
        let output = self.run_command_raw(&["cherry-pick", commit])?;
        if output.status.success() {
            return Ok(());
        }
        let message = join_output(&output);
        let paths = self.unmerged_paths().unwrap_or_default();
        let _ = self.run_command_raw(&["cherry-pick", "--abort"]);
        if !paths.is_empty() {
            return Err(VcsError::Conflict { paths });
        }
        Err(VcsError::CommandFailed {
            command: format!("cherry-pick {commit}"),
            message,
        })
    }

    /// Paths currently unmerged in the index (`git diff --name-only
    /// --diff-filter=U`), used to report cherry-pick conflicts.
    fn unmerged_paths(&self) -> Result<Vec<String>, VcsError> {
        let stdout = self.run_command(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(stdout.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Line/file diff stats between `base` and `head`.
    pub fn diff_stat(&self, base: &str, head: &str) -> Result<DiffStats, VcsError> {
        let range = format!("{base}..{head}");
        let stdout = self.run_command(&["diff", "--numstat", &range])?;
        let mut stats = DiffStats::default();
        for line in stdout.lines() {
            if let Some((added, deleted)) = parse::parse_numstat_line(line) {
                stats.files += 1;
                stats.insertions += added;
                stats.deletions += deleted;
            } else if !line.trim().is_empty() {
                stats.files += 1;
            }
        }
        Ok(stats)
    }

    /// Paths changed between `base` and `head`, including both sides of a
    /// rename/copy so overlap checks can't be fooled by a rename.
    pub fn diff_names(&self, base: &str, head: &str) -> Result<Vec<String>, VcsError> {
        let range = format!("{base}..{head}");
        let stdout = self.run_command(&["diff", "--name-status", "-z", &range])?;
        parse::parse_name_status_z(&stdout)
    }
}

fn join_output(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).replace('\r', "\n");
    let stdout = String::from_utf8_lossy(&output.stdout);
    [stderr.trim(), stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
