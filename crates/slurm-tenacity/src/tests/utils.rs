use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use log::LevelFilter;

use crate::Map;
use crate::executor::{CommandOutput, CommandSpec, Executor, check_command_output};

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

#[derive(Default)]
struct FakeState {
    /// Scripted outputs per command line. The last output of each queue is repeated.
    outputs: Map<String, VecDeque<CommandOutput>>,
    commands: Vec<String>,
    submissions: Vec<Vec<String>>,
    next_job_id: u64,
    sbatch_error: Option<String>,
    created_dirs: Vec<PathBuf>,
}

/// Executor that records commands and answers them from a script instead of running them.
///
/// `sbatch` is answered with consecutive job ids starting at 100. Unscripted commands
/// succeed with empty output. Filesystem operations go to the local filesystem, except
/// for directory creation, which is only recorded.
pub struct FakeExecutor {
    state: Mutex<FakeState>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        init_test_logging();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_job_id: 100,
                ..Default::default()
            }),
        })
    }

    pub fn push_output(&self, command: &str, stdout: &str) {
        self.push(
            command,
            CommandOutput {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn push_failure(&self, command: &str, code: i32) {
        self.push(
            command,
            CommandOutput {
                code,
                stdout: String::new(),
                stderr: "error".to_string(),
            },
        );
    }

    fn push(&self, command: &str, output: CommandOutput) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    /// Scripts the next answer of a `State` query of the given job.
    pub fn push_sacct_state(&self, job_id: u64, state: &str) {
        self.push_output(
            &format!("sacct --job={job_id} --noheader --parsable2 --format=State"),
            &format!("{state}\n"),
        );
    }

    pub fn push_elapsed(&self, job_id: u64, elapsed: &str) {
        self.push_output(
            &format!("sacct --job={job_id} --noheader --parsable2 --format=Elapsed"),
            &format!("{elapsed}\n"),
        );
    }

    pub fn push_max_rss(&self, job_id: u64, output: &str) {
        self.push_output(
            &format!("sacct --job={job_id} --noheader --parsable2 --format=MaxRSS --units=K"),
            output,
        );
    }

    pub fn fail_sbatch(&self, message: &str) {
        self.state.lock().unwrap().sbatch_error = Some(message.to_string());
    }

    /// All executed command lines, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, program: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(program))
            .count()
    }

    /// Arguments of all `sbatch` invocations, in order.
    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().created_dirs.clone()
    }

    fn answer(&self, command: &CommandSpec) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let line = command.args().join(" ");
        state.commands.push(line.clone());

        if command.args().first().map(|s| s.as_str()) == Some("sbatch") {
            state.submissions.push(command.args().to_vec());
            if let Some(error) = state.sbatch_error.clone() {
                return CommandOutput {
                    code: 1,
                    stdout: String::new(),
                    stderr: error,
                };
            }
            let job_id = state.next_job_id;
            state.next_job_id += 1;
            return CommandOutput {
                code: 0,
                stdout: format!("{job_id}\n"),
                stderr: String::new(),
            };
        }

        match state.outputs.get_mut(&line) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput::default(),
        }
    }
}

impl Executor for FakeExecutor {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn run(&self, command: CommandSpec) -> BoxFuture<'_, crate::Result<CommandOutput>> {
        Box::pin(async move {
            let output = self.answer(&command);
            check_command_output(&command, output)
        })
    }

    fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move { Ok(std::fs::read_to_string(path)?) })
    }

    fn read_head<'a>(&'a self, path: &'a Path, len: usize) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(async move {
            let content = std::fs::read(path)?;
            let head = &content[..len.min(content.len())];
            Ok(String::from_utf8_lossy(head).into_owned())
        })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .created_dirs
                .push(path.to_path_buf());
            Ok(())
        })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, crate::Result<bool>> {
        Box::pin(async move { Ok(path.exists()) })
    }
}
