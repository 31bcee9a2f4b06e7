//! Execution of shell commands on the machine that hosts the Slurm client tools.
//!
//! The scheduler is reachable only through its command line interface, either on the
//! local machine or on a login node reached over SSH. Both cases are hidden behind the
//! [`Executor`] trait, which also provides the few filesystem operations needed to prepare
//! job output directories and to read job output back.

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::SshExecutor;

use std::fmt::Write;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;

use crate::Map;
use crate::common::error::CommandError;
use crate::common::utils::str::shell_join;

/// A command line that should be executed by an [`Executor`].
#[derive(Debug, Clone)]
pub struct CommandSpec {
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Map<String, String>,
    capture_output: bool,
    check: bool,
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(|arg| arg.into()).collect(),
            cwd: None,
            env: Map::new(),
            capture_output: true,
            check: true,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Overrides (or adds) an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Lets stdout/stderr pass through to the parent instead of capturing them.
    pub fn inherit_output(mut self) -> Self {
        self.capture_output = false;
        self
    }

    /// A nonzero exit code is returned in [`CommandOutput`] instead of being an error.
    pub fn allow_failure(mut self) -> Self {
        self.check = false;
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env_overrides(&self) -> &Map<String, String> {
        &self.env
    }

    pub fn captures_output(&self) -> bool {
        self.capture_output
    }

    pub fn is_checked(&self) -> bool {
        self.check
    }

    /// Renders the command in a form that can be pasted into a shell.
    pub fn to_shell_line(&self) -> String {
        let mut line = String::new();
        if let Some(cwd) = &self.cwd {
            write!(line, "cd {} && ", shell_join(&[cwd.display().to_string()])).unwrap();
        }
        if !self.env.is_empty() {
            let mut vars: Vec<_> = self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            vars.sort();
            write!(line, "env {} ", shell_join(&vars)).unwrap();
        }
        line.push_str(&shell_join(&self.args));
        line
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Turns a failed checked command into an error.
pub(crate) fn check_command_output(
    command: &CommandSpec,
    output: CommandOutput,
) -> crate::Result<CommandOutput> {
    if command.is_checked() && !output.success() {
        return Err(CommandError {
            command: command.to_shell_line(),
            code: output.code,
            stdout: output.stdout.trim().to_string(),
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(output)
}

/// Capability to run commands (and touch files) where the Slurm client tools live.
///
/// Implementations must not run two commands concurrently against a session that is not
/// reentrant; [`SshExecutor`] serializes its commands internally.
pub trait Executor: Send + Sync {
    /// Short description of the target, used in log messages.
    fn name(&self) -> String;

    fn run(&self, command: CommandSpec) -> BoxFuture<'_, crate::Result<CommandOutput>>;

    fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            let command = CommandSpec::new(["cat".to_string(), path.display().to_string()]);
            Ok(self.run(command).await?.stdout)
        })
    }

    /// Reads at most `len` bytes from the start of a file.
    fn read_head<'a>(&'a self, path: &'a Path, len: usize) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            let command = CommandSpec::new([
                "head".to_string(),
                "-c".to_string(),
                len.to_string(),
                path.display().to_string(),
            ]);
            Ok(self.run(command).await?.stdout)
        })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let command = CommandSpec::new([
                "mkdir".to_string(),
                "-p".to_string(),
                path.display().to_string(),
            ]);
            self.run(command).await?;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<bool>> {
        Box::pin(async move {
            let command = CommandSpec::new([
                "test".to_string(),
                "-e".to_string(),
                path.display().to_string(),
            ])
            .allow_failure();
            Ok(self.run(command).await?.success())
        })
    }
}
