pub mod guard;
pub mod status;
pub mod wait;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytesize::ByteSize;

use crate::JobId;
use crate::common::error::{TenacityError, usage_error};
use crate::common::utils::time::parse_slurm_duration;
use crate::executor::{CommandSpec, Executor};
use crate::job::status::SimplifiedStatus;

/// A job that was submitted to Slurm.
///
/// Clones share the "still waiting" flag, which starts as `true` and is cleared for good
/// once a terminal status has been observed. The flag only serves to avoid pointless
/// cancellation requests.
#[derive(Clone)]
pub struct JobHandle {
    job_id: JobId,
    executor: Arc<dyn Executor>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    waiting: Arc<AtomicBool>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("executor", &self.executor.name())
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(
        job_id: JobId,
        executor: Arc<dyn Executor>,
        stdout: Option<PathBuf>,
        stderr: Option<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            executor,
            stdout,
            stderr,
            waiting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Observe a job that was submitted elsewhere. Its output paths are unknown.
    pub fn attach(job_id: JobId, executor: Arc<dyn Executor>) -> Self {
        Self::new(job_id, executor, None, None)
    }

    pub fn id(&self) -> JobId {
        self.job_id
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }

    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr.as_deref()
    }

    /// Returns `false` once any terminal status was observed for this job.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn read_stdout(&self) -> crate::Result<String> {
        self.read_output("stdout", self.stdout.as_deref()).await
    }

    pub async fn read_stderr(&self) -> crate::Result<String> {
        self.read_output("stderr", self.stderr.as_deref()).await
    }

    async fn read_output(&self, name: &str, path: Option<&Path>) -> crate::Result<String> {
        let Some(path) = path else {
            return usage_error(format!(
                "The {name} location of Slurm job {} is unknown",
                self.job_id
            ));
        };
        if self.executor.exists(path).await? {
            self.executor.read_to_string(path).await
        } else {
            Ok(String::new())
        }
    }

    fn sacct_command(&self, field: &str) -> Vec<String> {
        vec![
            "sacct".to_string(),
            format!("--job={}", self.job_id),
            "--noheader".to_string(),
            "--parsable2".to_string(),
            format!("--format={field}"),
        ]
    }

    /// Returns all output lines of `sacct` for a single field.
    async fn sacct_lines(&self, args: Vec<String>) -> crate::Result<Vec<String>> {
        let output = self.executor.run(CommandSpec::new(args)).await?;
        Ok(output.stdout.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Returns the first line of `sacct` output for a single field.
    async fn sacct_field(&self, field: &str) -> crate::Result<String> {
        let lines = self.sacct_lines(self.sacct_command(field)).await?;
        Ok(lines.into_iter().next().unwrap_or_default())
    }

    /// Queries the current simplified status of the job.
    pub async fn status(&self) -> crate::Result<SimplifiedStatus> {
        let state = self.sacct_field("State").await?;
        let status = SimplifiedStatus::from_slurm_state(&state);
        log::info!(
            "Slurm job {}: status = {status}, state = {state:?}",
            self.job_id
        );
        if status.is_terminal() {
            self.waiting.store(false, Ordering::SeqCst);
        }
        Ok(status)
    }

    /// Wall-clock time used by the job so far.
    pub async fn walltime(&self) -> crate::Result<Duration> {
        let value = self.sacct_field("Elapsed").await?;
        Ok(parse_slurm_duration(&value)?)
    }

    /// Time the job spent waiting in the queue.
    pub async fn queued_time(&self) -> crate::Result<Duration> {
        let value = self.sacct_field("Reserved").await?;
        Ok(parse_slurm_duration(&value)?)
    }

    pub async fn nnodes(&self) -> crate::Result<u32> {
        self.sacct_number("NNodes").await
    }

    pub async fn ncpus(&self) -> crate::Result<u32> {
        self.sacct_number("NCPUs").await
    }

    async fn sacct_number(&self, field: &str) -> crate::Result<u32> {
        let value = self.sacct_field(field).await?;
        value.parse().map_err(|_| {
            TenacityError::ParseError(format!(
                "Invalid {field} value {value:?} of Slurm job {}",
                self.job_id
            ))
        })
    }

    /// Maximum resident set size over all steps, nodes and time.
    ///
    /// Returns `None` if Slurm has no measurement for the job.
    pub async fn memory(&self) -> crate::Result<Option<ByteSize>> {
        let mut args = self.sacct_command("MaxRSS");
        args.push("--units=K".to_string());
        let lines = self.sacct_lines(args).await?;
        let mut max_kib: Option<u64> = None;
        for line in lines.iter().filter(|l| !l.is_empty()) {
            let kib = parse_kib(line).ok_or_else(|| {
                TenacityError::ParseError(format!(
                    "Invalid MaxRSS value {line:?} of Slurm job {}",
                    self.job_id
                ))
            })?;
            max_kib = Some(max_kib.map_or(kib, |current| current.max(kib)));
        }
        Ok(max_kib.map(ByteSize::kib))
    }

    /// Cancels the job unconditionally.
    pub async fn cancel(&self) -> crate::Result<()> {
        log::info!("Slurm job {}: canceling", self.job_id);
        self.executor
            .run(CommandSpec::new(["scancel".to_string(), self.job_id.to_string()]))
            .await?;
        Ok(())
    }

    /// Cancels the job if it is still queued or running.
    ///
    /// Returns `true` if a cancellation request was issued. No command at all is run once a
    /// terminal status has been observed.
    pub async fn terminate(&self) -> crate::Result<bool> {
        if self.is_waiting() && self.status().await?.is_waiting() {
            self.cancel().await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Parses a `MaxRSS` value printed with `--units=K` (e.g. `2000K`).
fn parse_kib(value: &str) -> Option<u64> {
    let digits = value.strip_suffix(|c: char| c.is_ascii_alphabetic()).unwrap_or(value);
    let kib: f64 = digits.parse().ok()?;
    (kib >= 0.0).then_some(kib.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use bytesize::ByteSize;

    use super::parse_kib;
    use crate::Error;
    use crate::job::JobHandle;
    use crate::job::status::SimplifiedStatus;
    use crate::tests::utils::FakeExecutor;

    #[test]
    fn test_parse_kib() {
        assert_eq!(parse_kib("2000K"), Some(2000));
        assert_eq!(parse_kib("12"), Some(12));
        assert_eq!(parse_kib("1.5K"), Some(2));
        assert_eq!(parse_kib("K"), None);
        assert_eq!(parse_kib("abc"), None);
    }

    #[tokio::test]
    async fn status_queries_sacct() {
        let executor = FakeExecutor::new();
        executor.push_sacct_state(5, "RUNNING");
        let job = JobHandle::attach(5, executor.clone());
        assert_eq!(job.status().await.unwrap(), SimplifiedStatus::Waiting);
        assert!(job.is_waiting());
        assert_eq!(
            executor.commands(),
            vec!["sacct --job=5 --noheader --parsable2 --format=State"]
        );
    }

    #[tokio::test]
    async fn waiting_flag_is_monotonic() {
        let executor = FakeExecutor::new();
        executor.push_sacct_state(5, "COMPLETED");
        executor.push_sacct_state(5, "");
        executor.push_sacct_state(5, "RUNNING");
        let job = JobHandle::attach(5, executor.clone());
        let clone = job.clone();

        assert_eq!(job.status().await.unwrap(), SimplifiedStatus::Success);
        assert!(!job.is_waiting());
        assert!(!clone.is_waiting());

        assert_eq!(job.status().await.unwrap(), SimplifiedStatus::Waiting);
        assert!(!job.is_waiting());
        assert_eq!(job.status().await.unwrap(), SimplifiedStatus::Waiting);
        assert!(!clone.is_waiting());
    }

    #[tokio::test]
    async fn status_takes_first_line() {
        let executor = FakeExecutor::new();
        executor.push_output(
            "sacct --job=9 --noheader --parsable2 --format=State",
            "OUT_OF_MEMORY\nOUT_OF_MEMORY\nCANCELLED\n",
        );
        let job = JobHandle::attach(9, executor);
        assert_eq!(job.status().await.unwrap(), SimplifiedStatus::FailedMem);
    }

    #[tokio::test]
    async fn durations_and_counts() {
        let executor = FakeExecutor::new();
        executor.push_output(
            "sacct --job=3 --noheader --parsable2 --format=Elapsed",
            "1-02:03:04\n1-02:03:04\n",
        );
        executor.push_output(
            "sacct --job=3 --noheader --parsable2 --format=Reserved",
            "00:00:42\n",
        );
        executor.push_output("sacct --job=3 --noheader --parsable2 --format=NNodes", "2\n");
        executor.push_output("sacct --job=3 --noheader --parsable2 --format=NCPUs", "64\n");
        let job = JobHandle::attach(3, executor);

        assert_eq!(
            job.walltime().await.unwrap(),
            Duration::from_secs(24 * 3600 + 2 * 3600 + 3 * 60 + 4)
        );
        assert_eq!(job.queued_time().await.unwrap(), Duration::from_secs(42));
        assert_eq!(job.nnodes().await.unwrap(), 2);
        assert_eq!(job.ncpus().await.unwrap(), 64);
    }

    #[tokio::test]
    async fn memory_takes_maximum_over_steps() {
        let executor = FakeExecutor::new();
        executor.push_max_rss(4, "\n1200K\n2000K\n16K\n");
        let job = JobHandle::attach(4, executor);
        assert_eq!(job.memory().await.unwrap(), Some(ByteSize::kib(2000)));
    }

    #[tokio::test]
    async fn memory_unknown_without_measurements() {
        let executor = FakeExecutor::new();
        executor.push_max_rss(4, "\n\n");
        let job = JobHandle::attach(4, executor);
        assert_eq!(job.memory().await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_count_is_parse_error() {
        let executor = FakeExecutor::new();
        executor.push_output(
            "sacct --job=3 --noheader --parsable2 --format=NCPUs",
            "many\n",
        );
        let job = JobHandle::attach(3, executor);
        assert!(matches!(job.ncpus().await, Err(Error::ParseError(_))));
    }

    #[tokio::test]
    async fn read_output_of_attached_job_is_usage_error() {
        let job = JobHandle::attach(1, FakeExecutor::new());
        assert!(matches!(job.read_stdout().await, Err(Error::Usage(_))));
        assert!(matches!(job.read_stderr().await, Err(Error::Usage(_))));
    }

    #[tokio::test]
    async fn read_missing_output_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = FakeExecutor::new();
        let stdout = dir.path().join("slurm-1.out");
        std::fs::write(&stdout, "done\n").unwrap();
        let job = JobHandle::new(
            1,
            executor,
            Some(stdout),
            Some(PathBuf::from(dir.path().join("missing.err"))),
        );
        assert_eq!(job.read_stdout().await.unwrap(), "done\n");
        assert_eq!(job.read_stderr().await.unwrap(), "");
    }

    #[tokio::test]
    async fn terminate_running_job() {
        let executor = FakeExecutor::new();
        executor.push_sacct_state(8, "PENDING");
        let job = JobHandle::attach(8, executor.clone());
        assert!(job.terminate().await.unwrap());
        assert_eq!(executor.count_commands("scancel"), 1);
        assert_eq!(executor.commands().last().unwrap(), "scancel 8");
    }

    #[tokio::test]
    async fn terminate_finished_job() {
        let executor = FakeExecutor::new();
        executor.push_sacct_state(8, "FAILED");
        let job = JobHandle::attach(8, executor.clone());
        assert!(!job.terminate().await.unwrap());
        // The flag is cleared now, so no further query happens
        assert!(!job.terminate().await.unwrap());
        assert_eq!(executor.count_commands("scancel"), 0);
        assert_eq!(executor.count_commands("sacct"), 1);
    }
}
