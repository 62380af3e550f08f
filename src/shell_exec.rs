//! Subprocess execution with structured logging.
//!
//! Every git/agent invocation in this crate funnels through [`run`] so that
//! `RUST_LOG=debug` gets a single consistent trace of what ran, where, and
//! how long it took, without each call site re-implementing timing/logging.

use std::process::{Command, Output};
use std::time::Instant;

/// Run `cmd`, logging the invocation and its duration/outcome at debug level.
///
/// `context` is a short label (e.g. a worktree's display name) attached to
/// the log line so concurrent invocations can be told apart.
pub fn run(cmd: &mut Command, context: Option<&str>) -> std::io::Result<Output> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
    let cmd_str = if args.is_empty() {
        program
    } else {
        format!("{program} {}", args.join(" "))
    };

    match context {
        Some(ctx) => log::debug!("$ {cmd_str} [{ctx}]"),
        None => log::debug!("$ {cmd_str}"),
    }

    let t0 = Instant::now();
    let result = cmd.output();
    let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;

    match (&result, context) {
        (Ok(output), Some(ctx)) => log::debug!(
            "[chopstack-trace] context={ctx} cmd=\"{cmd_str}\" dur={duration_ms:.1}ms ok={}",
            output.status.success()
        ),
        (Ok(output), None) => log::debug!(
            "[chopstack-trace] cmd=\"{cmd_str}\" dur={duration_ms:.1}ms ok={}",
            output.status.success()
        ),
        (Err(e), Some(ctx)) => {
            log::debug!("[chopstack-trace] context={ctx} cmd=\"{cmd_str}\" dur={duration_ms:.1}ms err=\"{e}\"");
        }
        (Err(e), None) => {
            log::debug!("[chopstack-trace] cmd=\"{cmd_str}\" dur={duration_ms:.1}ms err=\"{e}\"");
        }
    }

    result
}

/// A small builder over [`std::process::Command`] that carries a logging
/// context through to [`run`].
#[must_use]
pub struct Cmd {
    inner: Command,
    context: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        Self {
            inner: Command::new(program),
            context: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.inner.current_dir(dir);
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn run(mut self) -> std::io::Result<Output> {
        run(&mut self.inner, self.context.as_deref())
    }

    /// Consume the builder, returning the underlying [`Command`] for callers
    /// that need to spawn instead of capture output (e.g. the agent runner,
    /// which streams stdin and enforces a timeout).
    pub fn into_command(self) -> Command {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_successful_output() {
        let mut cmd = Command::new("true");
        let output = run(&mut cmd, Some("test")).expect("spawn true");
        assert!(output.status.success());
    }

    #[test]
    fn cmd_builder_runs_and_captures_stdout() {
        let output = Cmd::new("echo")
            .args(["hello"])
            .context("test")
            .run()
            .expect("spawn echo");
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
