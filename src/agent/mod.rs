//! Spawns the external coding agent for one task, enforcing a timeout and
//! supporting cancellation by killing the child.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wait_timeout::ChildExt;

/// Outcome of running the agent for one task.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// A run-wide flag the scheduler flips to kill every in-flight agent child.
/// Cloned cheaply into each task's runner.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawns the configured agent command, in the given directory, with
/// `prompt` piped to its stdin, and its combined stdout/stderr captured.
pub struct AgentRunner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(command: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            args,
            timeout,
        }
    }

    /// Returns `Err` only when the child could not be spawned at all (e.g.
    /// the binary is missing); every other outcome — success, non-zero
    /// exit, timeout, cancellation — is reported in [`AgentOutcome`].
    pub fn run(
        &self,
        prompt: &str,
        workdir: &Path,
        cancellation: &CancellationToken,
    ) -> std::io::Result<AgentOutcome> {
        // `Command::spawn` would report this as a generic OS error; resolving
        // it up front via `which` gives a clearer not-found message and
        // matches how this crate's other external-command callers probe
        // availability.
        if which::which(&self.command).is_err() && !Path::new(&self.command).exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("agent command not found: {}", self.command),
            ));
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit before reading all of a large prompt; a
            // closed pipe is not a runner failure.
            let _ = stdin.write_all(prompt.as_bytes());
        }

        // Poll in short slices so a cancellation request lands promptly
        // instead of waiting out the full timeout.
        let poll_interval = Duration::from_millis(200).min(self.timeout);
        let mut waited = Duration::ZERO;
        let status = loop {
            if cancellation.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(AgentOutcome {
                    success: false,
                    exit_code: None,
                    output: collect_output(&mut child),
                    timed_out: false,
                    cancelled: true,
                });
            }

            match child.wait_timeout(poll_interval)? {
                Some(status) => break Some(status),
                None => {
                    waited += poll_interval;
                    if waited >= self.timeout {
                        break None;
                    }
                }
            }
        };

        match status {
            Some(status) => Ok(AgentOutcome {
                success: status.success(),
                exit_code: status.code(),
                output: collect_output(&mut child),
                timed_out: false,
                cancelled: false,
            }),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Ok(AgentOutcome {
                    success: false,
                    exit_code: None,
                    output: collect_output(&mut child),
                    timed_out: true,
                    cancelled: false,
                })
            }
        }
    }
}

fn collect_output(child: &mut std::process::Child) -> String {
    use std::io::Read;
    let mut buf = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut buf);
    }
    if let Some(mut stderr) = child.stderr.take() {
        let mut err = String::new();
        if stderr.read_to_string(&mut err).is_ok() && !err.is_empty() {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&err);
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_success_on_zero_exit() {
        let runner = AgentRunner::new("true".to_string(), vec![], Duration::from_secs(5));
        let outcome = runner
            .run("prompt", Path::new("."), &CancellationToken::new())
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
    }

    #[test]
    fn reports_failure_on_nonzero_exit() {
        let runner = AgentRunner::new("false".to_string(), vec![], Duration::from_secs(5));
        let outcome = runner
            .run("prompt", Path::new("."), &CancellationToken::new())
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[test]
    fn times_out_a_long_running_child() {
        let runner = AgentRunner::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 30".to_string()],
            Duration::from_millis(300),
        );
        let outcome = runner
            .run("prompt", Path::new("."), &CancellationToken::new())
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
    }

    #[test]
    fn cancellation_kills_child_promptly() {
        let token = CancellationToken::new();
        let runner = AgentRunner::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 30".to_string()],
            Duration::from_secs(10),
        );
        token.cancel();
        let outcome = runner.run("prompt", Path::new("."), &token).unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success);
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let runner = AgentRunner::new(
            "definitely-not-a-real-binary".to_string(),
            vec![],
            Duration::from_secs(1),
        );
        let result = runner.run("prompt", Path::new("."), &CancellationToken::new());
        assert!(result.is_err());
    }
}
