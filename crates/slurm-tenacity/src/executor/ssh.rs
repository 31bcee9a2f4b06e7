use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::executor::local::run_process;
use crate::executor::{CommandOutput, CommandSpec, Executor, check_command_output};

/// Runs commands on a remote host (typically a cluster login node) through `ssh`.
///
/// Authentication has to work without interaction (e.g. with SSH keys or an agent).
/// Commands are executed one at a time.
pub struct SshExecutor {
    destination: String,
    ssh_args: Vec<String>,
    session: Mutex<()>,
}

impl SshExecutor {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ssh_args: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            session: Mutex::new(()),
        }
    }

    /// Additional options passed to `ssh` before the destination.
    pub fn with_ssh_args(mut self, args: Vec<String>) -> Self {
        self.ssh_args.extend(args);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn ssh_command_line(&self, command: &CommandSpec) -> Vec<String> {
        let mut args = Vec::with_capacity(self.ssh_args.len() + 4);
        args.push("ssh".to_string());
        args.extend(self.ssh_args.iter().cloned());
        args.push("--".to_string());
        args.push(self.destination.clone());
        args.push(command.to_shell_line());
        args
    }
}

impl Executor for SshExecutor {
    fn name(&self) -> String {
        format!("ssh:{}", self.destination)
    }

    fn run(&self, command: CommandSpec) -> BoxFuture<'_, crate::Result<CommandOutput>> {
        Box::pin(async move {
            let args = self.ssh_command_line(&command);
            // Working directory and environment are applied on the remote side
            let local = if command.captures_output() {
                CommandSpec::new(args.clone())
            } else {
                CommandSpec::new(args.clone()).inherit_output()
            };

            let _session = self.session.lock().await;
            log::debug!(
                "Running command `{}` on {}",
                command.to_shell_line(),
                self.destination
            );
            let output = run_process(&args, &local).await?;
            check_command_output(&command, output)
        })
    }
}
