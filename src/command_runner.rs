//! Abstraction over external command execution for testability.
//!
//! Every process cibox launches (proot, package managers, the sandboxed
//! program itself) goes through [`CommandRunner`]. Production code uses
//! [`RealCommandRunner`]; tests use [`MockCommandRunner`], which records each
//! call and answers with queued exit statuses so nothing is spawned.

use std::collections::VecDeque;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Mutex;

/// Stored as `Arc<dyn CommandRunner>` by the provisioner and the sandboxes.
pub trait CommandRunner: Send + Sync {
    /// Run a command with inherited stdio and return its exit status.
    fn run_status(&self, program: &str, args: &[&str], options: &CommandOptions)
        -> io::Result<ExitStatus>;
}

/// Options for command execution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Environment variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandOptions {
    pub fn with_env(env: Vec<(String, String)>) -> Self {
        Self { cwd: None, env }
    }
}

/// Production implementation that delegates to [`std::process::Command`].
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run_status(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> io::Result<ExitStatus> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }
        tracing::debug!(program, ?args, "spawning");
        cmd.status().map_err(|e| {
            io::Error::new(e.kind(), format!("failed to run '{program}': {e}"))
        })
    }
}

/// One invocation seen by [`MockCommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub options: CommandOptions,
}

impl RecordedCall {
    /// Program and arguments joined with spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Test double that records calls and replays queued statuses.
///
/// Calls beyond the queue succeed with exit code 0.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<RecordedCall>>,
    statuses: Mutex<VecDeque<ExitStatus>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normal exit with `code` for the next unanswered call.
    pub fn push_exit(&self, code: i32) {
        self.push_raw(code << 8);
    }

    /// Queue a termination by `signal` for the next unanswered call.
    pub fn push_signal(&self, signal: i32) {
        self.push_raw(signal & 0x7f);
    }

    fn push_raw(&self, raw: i32) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push_back(ExitStatus::from_raw(raw));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    /// Number of calls whose command line contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.command_line().contains(needle))
            .count()
    }
}

impl CommandRunner for MockCommandRunner {
    fn run_status(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> io::Result<ExitStatus> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            options: options.clone(),
        };
        self.calls
            .lock()
            .map_err(|_| io::Error::other("mock runner poisoned"))?
            .push(call);

        let next = self
            .statuses
            .lock()
            .map_err(|_| io::Error::other("mock runner poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(|| ExitStatus::from_raw(0)))
    }
}
