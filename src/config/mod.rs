//! Engine configuration.
//!
//! Unlike a tool with separate user-level and project-level configs, the
//! engine has exactly one configuration surface: `.chopstack/config.toml`
//! at the repository root, checked into git alongside the plans it's used
//! to run. There's no merge/precedence step because there's only one file;
//! callers that want an override just edit it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for commit message generation, reusing the same three
/// knobs the commit generator needs: an external command to shell out to,
/// and an inline template to render before piping it to that command's
/// stdin.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CommitGenerationConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Inline template. Available variables: `{{ title }}`, `{{ description }}`,
    /// `{{ files }}` (list), `{{ diff_summary }}`.
    #[serde(default)]
    pub template: Option<String>,
}

impl CommitGenerationConfig {
    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }
}

/// Configuration for the external agent invoked per task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "agent".to_string(),
            args: Vec::new(),
        }
    }
}

/// Top-level engine configuration, loaded from `.chopstack/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory (relative to repo root) holding task worktrees.
    #[serde(rename = "shadow-dir")]
    pub shadow_dir: String,

    /// Prefix applied to every branch the engine creates.
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Maximum number of tasks run concurrently. `None` means "size to the
    /// widest execution layer, capped by available parallelism".
    #[serde(rename = "max-parallel-tasks")]
    pub max_parallel_tasks: Option<usize>,

    #[serde(rename = "task-timeout-secs")]
    pub task_timeout_secs: u64,

    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "retry-backoff-secs")]
    pub retry_backoff_secs: u64,

    pub agent: AgentConfig,

    #[serde(rename = "commit-generation")]
    pub commit_generation: CommitGenerationConfig,

    /// Command + args invoked once the stack is assembled (e.g. to open a
    /// review). `None` disables submission entirely.
    #[serde(rename = "submit-command")]
    pub submit_command: Option<String>,
    #[serde(rename = "submit-args")]
    pub submit_args: Vec<String>,

    /// Continue scheduling independent tasks after one fails, rather than
    /// cancelling the whole run.
    #[serde(rename = "continue-on-error")]
    pub continue_on_error: bool,

    /// Stage every change in the worktree (`git add -A`) rather than only
    /// the task's declared `writes`.
    #[serde(rename = "include-all")]
    pub include_all: bool,

    /// Remove the task's worktree and branch after a failed run.
    #[serde(rename = "cleanup-on-failure")]
    pub cleanup_on_failure: bool,

    /// Allow committing a task whose only diff is whitespace, via
    /// `git commit --allow-empty`, instead of treating it as nothing to
    /// commit.
    #[serde(rename = "allow-empty-commits")]
    pub allow_empty_commits: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shadow_dir: ".chopstack/shadows".to_string(),
            branch_prefix: "chopstack/".to_string(),
            max_parallel_tasks: None,
            task_timeout_secs: 300,
            max_retries: 1,
            retry_backoff_secs: 2,
            agent: AgentConfig::default(),
            commit_generation: CommitGenerationConfig::default(),
            submit_command: None,
            submit_args: Vec::new(),
            continue_on_error: false,
            include_all: false,
            cleanup_on_failure: true,
            allow_empty_commits: false,
        }
    }
}

impl EngineConfig {
    /// Path to the config file within a repository root.
    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".chopstack").join("config.toml")
    }

    /// Load configuration from `<repo_root>/.chopstack/config.toml`,
    /// falling back to defaults when the file doesn't exist.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::config_path(repo_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Effective shadow directory, resolved to an absolute path and with a
    /// leading `~` expanded.
    pub fn shadow_dir(&self, repo_root: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(&self.shadow_dir).into_owned();
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            repo_root.join(path)
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    /// Number of tasks to run concurrently for a layer of `layer_width`
    /// independent tasks.
    pub fn effective_parallelism(&self, layer_width: usize) -> usize {
        let available = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let cap = self.max_parallel_tasks.unwrap_or(available);
        layer_width.min(cap).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn loads_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".chopstack")).unwrap();
        std::fs::write(
            EngineConfig::config_path(dir.path()),
            r#"
            branch-prefix = "custom/"
            max-retries = 3

            [agent]
            command = "claude"
            args = ["-p"]
            "#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.branch_prefix, "custom/");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.shadow_dir, ".chopstack/shadows");
    }

    #[test]
    fn effective_parallelism_caps_to_layer_width() {
        let mut config = EngineConfig::default();
        config.max_parallel_tasks = Some(8);
        assert_eq!(config.effective_parallelism(3), 3);
        assert_eq!(config.effective_parallelism(20), 8);
    }
}
