//! Drives a validated plan to completion: layer-by-layer, parallel within a
//! layer up to a cap, with retries, cancellation, and a dry-run mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;

use crate::agent::{AgentRunner, CancellationToken};
use crate::commit_gen;
use crate::config::EngineConfig;
use crate::dag;
use crate::events::{Event, EventBus};
use crate::plan::{Plan, Task};
use crate::workspace::WorkspaceManager;

/// A task's position in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Ready,
    Queued,
    Running,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Blocked | Self::Skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: chrono::DateTime<Utc>,
    pub reason: Option<String>,
}

/// A task extended with everything the scheduler tracks at runtime.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub task: Task,
    pub state: TaskState,
    pub history: Vec<StateTransition>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub commit_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub workspace_path: Option<PathBuf>,
}

impl ExecutionTask {
    fn new(task: Task, max_retries: u32) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            history: Vec::new(),
            retry_count: 0,
            max_retries,
            started_at: None,
            ended_at: None,
            commit_id: None,
            exit_code: None,
            output: String::new(),
            workspace_path: None,
        }
    }

    fn transition(&mut self, to: TaskState, reason: Option<String>) {
        self.history.push(StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason,
        });
        self.state = to;
    }
}

/// Summary of a completed (or cancelled) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub tasks: HashMap<String, ExecutionTask>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Knobs for one run, separate from [`EngineConfig`] because they vary per
/// invocation rather than per repository.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub base_ref: String,
    pub dry_run: bool,
}

pub struct Scheduler {
    plan: Plan,
    config: EngineConfig,
    workspace: WorkspaceManager,
    events: EventBus,
    cancellation: CancellationToken,
}

impl Scheduler {
    pub fn new(
        plan: Plan,
        config: EngineConfig,
        workspace: WorkspaceManager,
        events: EventBus,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            plan,
            config,
            workspace,
            events,
            cancellation,
        }
    }

    /// Run the plan to completion. The caller must have already validated
    /// the plan with [`dag::validate`]; this does not re-validate.
    pub fn run(&self, options: &RunOptions) -> RunResult {
        let start = Instant::now();
        let layers = dag::layers(&self.plan);

        let mut tasks: HashMap<String, ExecutionTask> = self
            .plan
            .tasks
            .iter()
            .map(|t| (t.id.clone(), ExecutionTask::new(t.clone(), self.config.max_retries)))
            .collect();

        let mut cancelled = false;

        'layers: for (layer_index, layer) in layers.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }

            self.promote_ready_or_blocked(&mut tasks, layer);

            let mut runnable: Vec<String> = layer
                .iter()
                .filter(|id| tasks[id.as_str()].state == TaskState::Ready)
                .cloned()
                .collect();

            while !runnable.is_empty() {
                if self.cancellation.is_cancelled() {
                    cancelled = true;
                    break 'layers;
                }

                for id in &runnable {
                    let t = tasks.get_mut(id).unwrap();
                    self.transition_task(t, TaskState::Queued, None);
                }

                let parallelism = self.config.effective_parallelism(runnable.len());
                let results = self.run_batch(&runnable, options, parallelism);

                let mut retry: Vec<String> = Vec::new();
                for (id, outcome) in results {
                    let t = tasks.get_mut(&id).unwrap();
                    self.apply_outcome(t, outcome, &mut retry);
                }

                if !retry.is_empty() {
                    std::thread::sleep(self.config.retry_backoff());
                }
                runnable = retry;
            }

            self.events.publish(Event::RunProgress {
                layer: layer_index,
                total: layers.len(),
                running: 0,
                completed: tasks.values().filter(|t| t.state == TaskState::Completed).count(),
                failed: tasks.values().filter(|t| t.state == TaskState::Failed).count(),
            });
        }

        if cancelled {
            for t in tasks.values_mut() {
                if !t.state.is_terminal() {
                    self.transition_task(t, TaskState::Failed, Some("Cancelled".to_string()));
                }
            }
        }

        let completed = ids_in_state(&tasks, TaskState::Completed);
        let failed = ids_in_state(&tasks, TaskState::Failed);
        let blocked = ids_in_state(&tasks, TaskState::Blocked);
        let skipped = ids_in_state(&tasks, TaskState::Skipped);

        RunResult {
            tasks,
            completed,
            failed,
            blocked,
            skipped,
            // `cancelled` is only flipped at the loop-top/batch-top checkpoints;
            // a cancel fired mid-batch in the last layer never reaches one of
            // those checkpoints again. The token itself is a latch, so OR it
            // in here to catch that case.
            cancelled: cancelled || self.cancellation.is_cancelled(),
            duration: start.elapsed(),
        }
    }

    /// Move `Pending` tasks in `layer` to `Ready`, `Blocked`, or `Skipped`
    /// depending on whether their dependencies are terminally resolved.
    fn promote_ready_or_blocked(&self, tasks: &mut HashMap<String, ExecutionTask>, layer: &[String]) {
        for id in layer {
            let requires = tasks[id].task.requires.clone();
            if tasks[id].state != TaskState::Pending {
                continue;
            }
            let any_failed = requires
                .iter()
                .any(|dep| tasks.get(dep).map(|t| t.state == TaskState::Failed).unwrap_or(false));
            let all_completed = requires
                .iter()
                .all(|dep| tasks.get(dep).map(|t| t.state == TaskState::Completed).unwrap_or(false));

            let t = tasks.get_mut(id).unwrap();
            if any_failed {
                if self.config.continue_on_error {
                    self.transition_task(t, TaskState::Skipped, Some("dependency failed".to_string()));
                } else {
                    self.transition_task(t, TaskState::Blocked, Some("dependency failed".to_string()));
                }
            } else if all_completed {
                self.transition_task(t, TaskState::Ready, None);
            }
        }
    }

    /// Run a batch of ready tasks concurrently, capped at `parallelism`,
    /// following the dedicated-dispatch-thread + channel pattern used
    /// elsewhere in this crate for fan-out work.
    fn run_batch(
        &self,
        ids: &[String],
        options: &RunOptions,
        parallelism: usize,
    ) -> Vec<(String, TaskOutcome)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .build()
            .expect("failed to build scheduler thread pool");

        let ids = ids.to_vec();
        pool.install(|| {
            ids.into_par_iter().for_each(|id| {
                let outcome = self.run_one(&id, options);
                let _ = tx.send((id, outcome));
            });
        });
        drop(tx);

        rx.into_iter().collect()
    }

    /// Execute the per-task workflow described for the scheduler: acquire a
    /// workspace, run the agent, stage and commit on success.
    fn run_one(&self, id: &str, options: &RunOptions) -> TaskOutcome {
        let task = self.plan.task(id).expect("task id from plan's own layers");

        let context = match self.workspace.acquire(id, &options.base_ref) {
            Ok(c) => c,
            Err(e) => return TaskOutcome::workspace_error(e.to_string()),
        };
        self.events.publish(Event::WorkspaceCreated {
            task_id: id.to_string(),
            path: context.path.display().to_string(),
        });

        if options.dry_run {
            return TaskOutcome::dry_run(context.path.clone());
        }

        let runner = AgentRunner::new(
            self.config.agent.command.clone(),
            self.config.agent.args.clone(),
            self.config.task_timeout(),
        );
        let agent_result = runner.run(&task.agent_prompt, &context.path, &self.cancellation);

        match agent_result {
            Err(e) => TaskOutcome::agent_not_available(e.to_string(), context.path.clone()),
            Ok(agent_outcome) if agent_outcome.cancelled => {
                TaskOutcome::cancelled(agent_outcome.output, context.path.clone())
            }
            Ok(agent_outcome) if agent_outcome.timed_out => TaskOutcome::failed(
                format!("timed out after {}s", self.config.task_timeout_secs),
                agent_outcome.output,
                None,
                context.path.clone(),
            ),
            Ok(agent_outcome) if !agent_outcome.success => TaskOutcome::failed(
                "agent exited non-zero".to_string(),
                agent_outcome.output,
                agent_outcome.exit_code,
                context.path.clone(),
            ),
            Ok(agent_outcome) => self.finalize_success(task, &context.path, agent_outcome.output),
        }
    }

    fn finalize_success(&self, task: &Task, workspace: &PathBuf, agent_output: String) -> TaskOutcome {
        let repo = crate::vcs::Repository::at(workspace);

        let stage_result = if self.config.include_all {
            repo.stage_all()
        } else {
            repo.stage(&task.writes)
        };
        if let Err(e) = stage_result {
            return TaskOutcome::failed(format!("failed to stage changes: {e}"), agent_output, None, workspace.clone());
        }

        let has_changes = repo.has_staged_changes().unwrap_or(false);
        if !has_changes && !self.config.allow_empty_commits {
            return TaskOutcome::nothing_to_commit(agent_output, workspace.clone());
        }

        let files = task.writes.clone();
        let diff_summary = format!("{} files changed", files.len());
        let message = commit_gen::generate(&self.config.commit_generation, task, &files, &diff_summary);

        match repo.commit(&message, self.config.allow_empty_commits && !has_changes) {
            Ok(commit_id) => TaskOutcome::completed(commit_id, agent_output, workspace.clone()),
            Err(e) => TaskOutcome::failed(format!("commit failed: {e}"), agent_output, None, workspace.clone()),
        }
    }

    fn apply_outcome(&self, t: &mut ExecutionTask, outcome: TaskOutcome, retry: &mut Vec<String>) {
        self.transition_task(t, TaskState::Running, None);
        t.started_at.get_or_insert_with(Utc::now);
        t.workspace_path = outcome.workspace_path.clone();
        t.output = outcome.output.clone();
        t.exit_code = outcome.exit_code;

        match outcome.kind {
            OutcomeKind::Completed { commit_id } => {
                t.commit_id = Some(commit_id);
                t.ended_at = Some(Utc::now());
                self.transition_task(t, TaskState::Completed, None);
            }
            OutcomeKind::DryRun => {
                t.ended_at = Some(Utc::now());
                self.transition_task(t, TaskState::Completed, Some("dry-run".to_string()));
            }
            OutcomeKind::AgentNotAvailable { reason } | OutcomeKind::WorkspaceError { reason } => {
                t.ended_at = Some(Utc::now());
                self.transition_task(t, TaskState::Failed, Some(reason));
                // Not retryable: the binary is missing or workspace setup failed outright.
            }
            OutcomeKind::Cancelled { reason } => {
                t.ended_at = Some(Utc::now());
                self.transition_task(t, TaskState::Failed, Some(reason));
                // Cancellation is never retried.
            }
            OutcomeKind::Failed { reason } | OutcomeKind::NothingToCommit { reason } => {
                t.ended_at = Some(Utc::now());
                if t.retry_count < t.max_retries {
                    t.retry_count += 1;
                    self.transition_task(t, TaskState::Failed, Some(reason.clone()));
                    self.transition_task(t, TaskState::Ready, Some(format!("retry {}/{}", t.retry_count, t.max_retries)));
                    retry.push(t.task.id.clone());
                } else {
                    self.transition_task(t, TaskState::Failed, Some(reason));
                }
            }
        }
    }

    /// Transition a task and publish the resulting [`Event::TaskStateChange`]
    /// immediately, so every transition in the state machine reaches the
    /// event bus in order rather than only the last one per batch.
    fn transition_task(&self, t: &mut ExecutionTask, to: TaskState, reason: Option<String>) {
        t.transition(to, reason);
        if let Some(last) = t.history.last() {
            self.events.publish(Event::TaskStateChange {
                task_id: t.task.id.clone(),
                from: last.from,
                to: last.to,
                reason: last.reason.clone(),
                timestamp: last.timestamp,
            });
        }
    }
}

fn ids_in_state(tasks: &HashMap<String, ExecutionTask>, state: TaskState) -> Vec<String> {
    tasks
        .values()
        .filter(|t| t.state == state)
        .map(|t| t.task.id.clone())
        .collect()
}

enum OutcomeKind {
    Completed { commit_id: String },
    DryRun,
    AgentNotAvailable { reason: String },
    WorkspaceError { reason: String },
    Cancelled { reason: String },
    Failed { reason: String },
    NothingToCommit { reason: String },
}

struct TaskOutcome {
    kind: OutcomeKind,
    output: String,
    exit_code: Option<i32>,
    workspace_path: Option<PathBuf>,
}

impl TaskOutcome {
    fn completed(commit_id: String, output: String, workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::Completed { commit_id },
            output,
            exit_code: Some(0),
            workspace_path: Some(workspace_path),
        }
    }

    fn dry_run(workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::DryRun,
            output: String::new(),
            exit_code: Some(0),
            workspace_path: Some(workspace_path),
        }
    }

    fn workspace_error(reason: String) -> Self {
        Self {
            kind: OutcomeKind::WorkspaceError { reason },
            output: String::new(),
            exit_code: None,
            workspace_path: None,
        }
    }

    fn agent_not_available(reason: String, workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::AgentNotAvailable { reason },
            output: String::new(),
            exit_code: None,
            workspace_path: Some(workspace_path),
        }
    }

    fn cancelled(output: String, workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::Cancelled {
                reason: "Cancelled".to_string(),
            },
            output,
            exit_code: None,
            workspace_path: Some(workspace_path),
        }
    }

    fn failed(reason: String, output: String, exit_code: Option<i32>, workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::Failed { reason },
            output,
            exit_code,
            workspace_path: Some(workspace_path),
        }
    }

    fn nothing_to_commit(output: String, workspace_path: PathBuf) -> Self {
        Self {
            kind: OutcomeKind::NothingToCommit {
                reason: "nothing to commit".to_string(),
            },
            output,
            exit_code: Some(0),
            workspace_path: Some(workspace_path),
        }
    }
}
