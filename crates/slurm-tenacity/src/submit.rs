use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use derive_builder::Builder;

use crate::JobId;
use crate::common::error::TenacityError;
use crate::common::utils::str::shell_join;
use crate::common::utils::time::format_slurm_duration;
use crate::executor::{CommandSpec, Executor};
use crate::job::JobHandle;

/// Placeholder in output file names that Slurm replaces with the job id.
pub const JOB_ID_PLACEHOLDER: &str = "%j";

const DEFAULT_OUTPUT_FILE: &str = "slurm-%j.out";

const SHEBANG: &str = "#!";

/// Description of a job that should be submitted to Slurm.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct JobSpec {
    /// Program and its arguments. If the program is a script starting with `#!`, it is
    /// submitted as a batch script (its `#SBATCH` directives apply, but options given here
    /// take precedence).
    pub command: Vec<String>,
    /// Time limit of the job. Slurm's partition default is used when missing.
    #[builder(default, setter(strip_option))]
    pub walltime: Option<Duration>,
    /// Memory limit. Missing or zero means no explicit limit.
    #[builder(default, setter(strip_option))]
    pub memory: Option<ByteSize>,
    #[builder(default = "1")]
    pub ntasks: u32,
    #[builder(default = "1")]
    pub cpus_per_task: u32,
    #[builder(default)]
    pub gpus_per_task: u32,
    #[builder(default = "PathBuf::from(\".\")", setter(into))]
    pub cwd: PathBuf,
    #[builder(default, setter(into, strip_option))]
    pub job_name: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub partition: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub account: Option<String>,
    /// Stdout file; may contain `%j`. Relative paths are resolved against `cwd`.
    #[builder(default, setter(into, strip_option))]
    pub stdout: Option<PathBuf>,
    /// Stderr file; may contain `%j`. Relative paths are resolved against `cwd`.
    #[builder(default, setter(into, strip_option))]
    pub stderr: Option<PathBuf>,
}

impl JobSpecBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.command {
            Some(command) if command.is_empty() => Err("Job command cannot be empty".to_string()),
            _ => Ok(()),
        }
    }
}

impl JobSpec {
    pub fn builder<I, S>(command: I) -> JobSpecBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JobSpecBuilder::default().command(command.into_iter().map(|s| s.into()).collect())
    }

    fn output_path(&self, path: Option<&Path>) -> PathBuf {
        let path = path.unwrap_or(Path::new(DEFAULT_OUTPUT_FILE));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.output_path(self.stdout.as_deref())
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.output_path(self.stderr.as_deref())
    }
}

/// Replaces `%j` in the file name of `path` with the job id.
pub fn resolve_job_id_placeholder(path: &Path, job_id: JobId) -> PathBuf {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) if name.contains(JOB_ID_PLACEHOLDER) => {
            path.with_file_name(name.replace(JOB_ID_PLACEHOLDER, &job_id.to_string()))
        }
        _ => path.to_path_buf(),
    }
}

/// Builds the `sbatch` command line for `spec`.
///
/// `sbatch` is asked to print only the job id (`--parsable`).
fn build_sbatch_args(spec: &JobSpec, stdout: &Path, stderr: &Path, is_script: bool) -> Vec<String> {
    let mut args = vec!["sbatch".to_string()];
    if let Some(walltime) = &spec.walltime {
        args.push(format!("--time={}", format_slurm_duration(walltime)));
    }
    args.push(format!("--chdir={}", spec.cwd.display()));
    args.push(format!("--ntasks={}", spec.ntasks));
    args.push(format!("--cpus-per-task={}", spec.cpus_per_task));
    args.push(format!("--gpus-per-task={}", spec.gpus_per_task));
    if let Some(name) = &spec.job_name {
        args.push(format!("--job-name={name}"));
    }
    if let Some(partition) = &spec.partition {
        args.push(format!("--partition={partition}"));
    }
    args.push(format!("--output={}", stdout.display()));
    args.push(format!("--error={}", stderr.display()));
    if let Some(account) = &spec.account {
        args.push(format!("--account={account}"));
    }
    if !is_script {
        args.push(format!("--wrap={}", shell_join(&spec.command)));
    }
    if let Some(memory) = spec.memory.filter(|m| m.as_u64() > 0) {
        args.push(format!("--mem={}K", memory.as_u64().div_ceil(bytesize::KIB)));
    }
    args.push("--parsable".to_string());
    if is_script {
        args.extend(spec.command.iter().cloned());
    }
    args
}

/// Returns true if `path` is a readable file starting with an interpreter line.
async fn is_batch_script(executor: &dyn Executor, path: &Path) -> bool {
    executor
        .read_head(path, SHEBANG.len())
        .await
        .map(|head| head == SHEBANG)
        .unwrap_or(false)
}

/// Parses the output of `sbatch --parsable`, which is `<job-id>[;<cluster>]`.
fn parse_sbatch_output(output: &str) -> Option<JobId> {
    let line = output.lines().map(|l| l.trim()).find(|l| !l.is_empty())?;
    line.split(';').next()?.trim().parse().ok()
}

/// Submits a job to Slurm.
///
/// Parent directories of the output files are created first. Failures of `sbatch` are
/// reported as [`TenacityError::Submission`] and are never retried.
pub async fn submit_job(executor: &Arc<dyn Executor>, spec: &JobSpec) -> crate::Result<JobHandle> {
    let Some(program) = spec.command.first() else {
        return Err(TenacityError::Usage("Job command cannot be empty".to_string()));
    };
    let stdout = spec.stdout_path();
    let stderr = spec.stderr_path();
    for path in [&stdout, &stderr] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            executor.create_dir_all(parent).await?;
        }
    }

    let is_script = is_batch_script(executor.as_ref(), Path::new(program)).await;
    let args = build_sbatch_args(spec, &stdout, &stderr, is_script);
    let output = match executor.run(CommandSpec::new(args)).await {
        Ok(output) => output,
        Err(TenacityError::Command(error)) => {
            return Err(TenacityError::Submission(error.to_string()));
        }
        Err(error) => return Err(error),
    };
    let job_id = parse_sbatch_output(&output.stdout).ok_or_else(|| {
        TenacityError::Submission(format!(
            "Missing job id in sbatch output\n{}",
            output.stdout.trim()
        ))
    })?;
    log::info!("Started Slurm job {job_id}");

    Ok(JobHandle::new(
        job_id,
        executor.clone(),
        Some(resolve_job_id_placeholder(&stdout, job_id)),
        Some(resolve_job_id_placeholder(&stderr, job_id)),
    ))
}
