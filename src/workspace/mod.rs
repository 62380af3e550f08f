//! Creates, tracks, and releases isolated per-task workspaces rooted at a
//! shadow directory inside the host repository.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::warn;

use crate::error::EngineError;
use crate::vcs::Repository;

/// Everything the scheduler needs to know about one task's isolated
/// workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceContext {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Result of [`WorkspaceManager::verify`].
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    pub exists: bool,
    pub is_repo: bool,
    pub branch_name: Option<String>,
    pub has_changes: bool,
}

/// Outcome of [`WorkspaceManager::release_all`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseAllResult {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Owns the in-memory task→context registry and every worktree/branch the
/// engine creates for a run. Cheap to clone: the registry is shared behind
/// an `Arc`, mirroring the host repository's own cached-handle pattern.
#[derive(Clone)]
pub struct WorkspaceManager {
    host: Repository,
    shadow_dir: PathBuf,
    branch_prefix: String,
    registry: Arc<DashMap<String, WorkspaceContext>>,
}

impl WorkspaceManager {
    pub fn new(host: Repository, shadow_dir: PathBuf, branch_prefix: String) -> Self {
        Self {
            host,
            shadow_dir,
            branch_prefix,
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Acquire an isolated workspace for `task_id`, rooted on `base_ref`.
    /// Idempotent: acquiring an id already tracked returns the existing
    /// context rather than creating a second workspace.
    pub fn acquire(&self, task_id: &str, base_ref: &str) -> Result<WorkspaceContext, EngineError> {
        if let Some(existing) = self.registry.get(task_id) {
            return Ok(existing.clone());
        }

        let workspace_path = self.shadow_dir.join(crate::path::sanitize_component(task_id));
        let branch = self.unique_branch_name(task_id);

        self.host
            .create_worktree(&workspace_path, &branch, base_ref)
            .map_err(|e| EngineError::WorkspaceError {
                detail: format!("failed to create workspace for {task_id}: {e}"),
            })?;

        if !workspace_path.exists() {
            return Err(EngineError::WorkspaceError {
                detail: format!(
                    "workspace directory missing after creation: {}",
                    workspace_path.display()
                ),
            });
        }

        let context = WorkspaceContext {
            task_id: task_id.to_string(),
            path: workspace_path,
            branch,
            base_ref: base_ref.to_string(),
            created_at: Utc::now(),
        };
        self.registry.insert(task_id.to_string(), context.clone());
        Ok(context)
    }

    /// `prefix + task_id`, suffixed with a monotonic millisecond timestamp
    /// if that branch already exists.
    fn unique_branch_name(&self, task_id: &str) -> String {
        let candidate = format!("{}{}", self.branch_prefix, task_id);
        if self.host.branch_exists(&candidate) {
            let suffixed = format!("{candidate}-{}", Utc::now().timestamp_millis());
            warn!("branch {candidate} already exists, using {suffixed} instead");
            suffixed
        } else {
            candidate
        }
    }

    /// Release a task's workspace: remove the worktree directory, delete the
    /// branch unless `keep_branch`, and prune the shadow directory if it's
    /// now empty. A first removal failure triggers one forced retry;
    /// persistent failure is reported but does not raise.
    pub fn release(&self, task_id: &str, keep_branch: bool) -> Result<(), EngineError> {
        let Some((_, context)) = self.registry.remove(task_id) else {
            return Ok(());
        };

        if let Err(first_err) = self.host.remove_worktree(&context.path, false) {
            log::warn!("failed to remove workspace {task_id} cleanly ({first_err}), retrying with force");
            if let Err(second_err) = self.host.remove_worktree(&context.path, true) {
                log::error!("failed to remove workspace {task_id} even with force: {second_err}");
            }
        }

        if !keep_branch {
            let _ = self.host.delete_branch(&context.branch);
        }

        if self.shadow_dir.exists()
            && std::fs::read_dir(&self.shadow_dir)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
        {
            let _ = std::fs::remove_dir(&self.shadow_dir);
        }

        Ok(())
    }

    /// Release every currently tracked workspace, returning which ids were
    /// removed and which failed.
    pub fn release_all(&self, keep_branches: bool) -> ReleaseAllResult {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        let mut result = ReleaseAllResult::default();
        for id in ids {
            match self.release(&id, keep_branches) {
                Ok(()) => result.removed.push(id),
                Err(_) => result.failed.push(id),
            }
        }
        result
    }

    /// Inspect a tracked workspace for debugging, without mutating it.
    pub fn verify(&self, task_id: &str) -> VerifyResult {
        let Some(context) = self.registry.get(task_id) else {
            return VerifyResult {
                exists: false,
                is_repo: false,
                branch_name: None,
                has_changes: false,
            };
        };

        let exists = context.path.exists();
        let repo = Repository::at(&context.path);
        let is_repo = exists && repo.current_commit().is_ok();
        let has_changes = is_repo && repo.is_dirty().unwrap_or(false);

        VerifyResult {
            exists,
            is_repo,
            branch_name: Some(context.branch.clone()),
            has_changes,
        }
    }

    pub fn context(&self, task_id: &str) -> Option<WorkspaceContext> {
        self.registry.get(task_id).map(|e| e.clone())
    }

    /// Run `f` with an acquired workspace, releasing it on every exit path
    /// (success, error, or panic) so callers can't forget to release.
    pub fn with_workspace<T>(
        &self,
        task_id: &str,
        base_ref: &str,
        keep_branch_on_success: bool,
        f: impl FnOnce(&WorkspaceContext) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let context = self.acquire(task_id, base_ref)?;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&context)));
        let keep_branch = result.as_ref().map(|r| r.is_ok()).unwrap_or(false) && keep_branch_on_success;
        self.release(task_id, keep_branch)?;
        match result {
            Ok(inner) => inner,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
