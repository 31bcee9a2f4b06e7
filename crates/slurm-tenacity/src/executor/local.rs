use std::path::Path;
use std::process::Stdio;

use bstr::ByteSlice;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::common::error::usage_error;
use crate::executor::{CommandOutput, CommandSpec, Executor, check_command_output};

/// Runs commands as child processes of the current process.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Spawns `args` as a local process and waits for it.
pub(super) async fn run_process(
    args: &[String],
    command: &CommandSpec,
) -> crate::Result<CommandOutput> {
    let Some((program, rest)) = args.split_first() else {
        return usage_error("Cannot run an empty command".to_string());
    };
    let mut process = Command::new(program);
    process.args(rest);
    process.envs(command.env_overrides());
    process.kill_on_drop(true);
    if let Some(cwd) = command.working_dir() {
        process.current_dir(cwd);
    }

    let output = if command.captures_output() {
        let output = process.output().await?;
        CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout.to_str_lossy().into_owned(),
            stderr: output.stderr.to_str_lossy().into_owned(),
        }
    } else {
        let status = process
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        CommandOutput {
            code: status.code().unwrap_or(-1),
            ..Default::default()
        }
    };
    Ok(output)
}

impl Executor for LocalExecutor {
    fn name(&self) -> String {
        "local".to_string()
    }

    fn run(&self, command: CommandSpec) -> BoxFuture<'_, crate::Result<CommandOutput>> {
        Box::pin(async move {
            log::debug!("Running command `{}`", command.to_shell_line());
            let output = run_process(command.args(), &command).await?;
            check_command_output(&command, output)
        })
    }

    fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move { Ok(tokio::fs::read_to_string(path).await?) })
    }

    fn read_head<'a>(&'a self, path: &'a Path, len: usize) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            let file = tokio::fs::File::open(path).await?;
            let mut buffer = Vec::with_capacity(len);
            file.take(len as u64).read_to_end(&mut buffer).await?;
            Ok(buffer.to_str_lossy().into_owned())
        })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move { Ok(tokio::fs::create_dir_all(path).await?) })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<bool>> {
        Box::pin(async move { Ok(tokio::fs::try_exists(path).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::LocalExecutor;
    use crate::Error;
    use crate::executor::{CommandSpec, Executor};

    #[tokio::test]
    async fn run_captures_stdout() {
        let executor = LocalExecutor::new();
        let output = executor
            .run(CommandSpec::new(["sh", "-c", "echo hello; echo oops >&2"]))
            .await
            .unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn run_uses_env_and_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = LocalExecutor::new();
        let output = executor
            .run(
                CommandSpec::new(["sh", "-c", "echo $GREETING; pwd"])
                    .env("GREETING", "hi")
                    .cwd(dir.path()),
            )
            .await
            .unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn run_nonzero_exit() {
        let executor = LocalExecutor::new();
        let result = executor.run(CommandSpec::new(["sh", "-c", "exit 3"])).await;
        assert!(matches!(result, Err(Error::Command(e)) if e.code == 3));

        let output = executor
            .run(CommandSpec::new(["sh", "-c", "exit 3"]).allow_failure())
            .await
            .unwrap();
        assert_eq!(output.code, 3);
    }

    #[tokio::test]
    async fn run_empty_command() {
        let executor = LocalExecutor::new();
        let result = executor.run(CommandSpec::new(Vec::<String>::new())).await;
        assert!(matches!(result, Err(Error::Usage(_))));
    }

    #[tokio::test]
    async fn filesystem_operations() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = LocalExecutor::new();
        let nested = dir.path().join("a").join("b");
        assert!(!executor.exists(&nested).await.unwrap());
        executor.create_dir_all(&nested).await.unwrap();
        assert!(executor.exists(&nested).await.unwrap());

        let file = nested.join("out.txt");
        std::fs::write(&file, "content").unwrap();
        assert_eq!(executor.read_to_string(&file).await.unwrap(), "content");
        assert_eq!(executor.read_head(&file, 3).await.unwrap(), "con");
        assert_eq!(executor.read_head(&file, 100).await.unwrap(), "content");
        assert!(executor.read_head(&nested.join("missing"), 2).await.is_err());
    }
}
