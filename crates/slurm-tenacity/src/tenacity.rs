//! Submission with automatic retries and resource escalation.
//!
//! A job that fails because it ran out of memory or time is resubmitted with a larger
//! request, a job that failed for reasons outside of its control (preemption, node failure,
//! cancellation) is resubmitted unchanged. Once a job succeeds, its observed resource usage
//! (with a safety margin) is remembered in the [`AllocationCache`] and used for the next
//! submission of the same job.
//!
//! There is no limit on the number of attempts: a job that can never fit into the cluster
//! is resubmitted forever.

use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;

use crate::cache::{AllocationCache, AllocationRecord, JobSignature};
use crate::common::error::TenacityError;
use crate::common::utils::runtime::block_on;
use crate::common::utils::time::{format_slurm_duration, scale_duration};
use crate::config::TenacityConfig;
use crate::executor::Executor;
use crate::job::JobHandle;
use crate::job::status::SimplifiedStatus;
use crate::submit::{JobSpec, submit_job};

/// Resources requested by one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub walltime: Duration,
    /// Zero means no explicit limit.
    pub memory: ByteSize,
}

/// What to do after an attempt ended with a given status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Resubmit(ResourceRequest),
    Finish,
    Abort,
}

fn scale_memory(memory: ByteSize, factor: f64) -> ByteSize {
    ByteSize::b((memory.as_u64() as f64 * factor).round() as u64)
}

/// Decides how to continue after an attempt with `request` finished with `status`.
pub fn next_step(
    config: &TenacityConfig,
    request: ResourceRequest,
    status: &SimplifiedStatus,
) -> NextStep {
    match status {
        SimplifiedStatus::FailedMem => {
            let memory = if request.memory.as_u64() == 0 {
                config.memory_floor()
            } else {
                scale_memory(request.memory, config.memory_escalation)
            };
            NextStep::Resubmit(ResourceRequest { memory, ..request })
        }
        SimplifiedStatus::FailedTime => NextStep::Resubmit(ResourceRequest {
            walltime: scale_duration(request.walltime, config.walltime_escalation),
            ..request
        }),
        SimplifiedStatus::FailedRetry => NextStep::Resubmit(request),
        SimplifiedStatus::Success => NextStep::Finish,
        SimplifiedStatus::Waiting
        | SimplifiedStatus::Failed
        | SimplifiedStatus::Unknown(_) => NextStep::Abort,
    }
}

pub struct TenacitySubmitter {
    executor: Arc<dyn Executor>,
    cache: Arc<AllocationCache>,
    config: TenacityConfig,
}

impl TenacitySubmitter {
    pub fn new(
        executor: Arc<dyn Executor>,
        cache: Arc<AllocationCache>,
        config: TenacityConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &TenacityConfig {
        &self.config
    }

    pub fn cache(&self) -> &AllocationCache {
        &self.cache
    }

    /// Resources for the first attempt: explicit values from `spec`, then cached values,
    /// then defaults.
    fn initial_request(
        &self,
        spec: &JobSpec,
        signature: &JobSignature,
    ) -> crate::Result<ResourceRequest> {
        let (walltime, memory) = self.cache.transaction(|allocations| {
            let cached = allocations.get(signature);
            if let Some(record) = cached {
                log::debug!("Found cached allocation for {signature:?}: {record:?}");
            }
            Ok((
                spec.walltime.or(cached.map(|r| r.walltime)),
                spec.memory.or(cached.and_then(|r| r.memory)),
            ))
        })?;
        Ok(ResourceRequest {
            walltime: walltime.unwrap_or(self.config.default_walltime),
            memory: memory.unwrap_or(ByteSize::b(0)),
        })
    }

    /// Submits `spec` and resubmits it with more resources until it succeeds.
    ///
    /// `key` distinguishes runs of the same command whose resource needs differ. Walltime
    /// and memory set in `spec` take precedence over cached values. Returns the handle of the
    /// successful job, or an error if the job failed for a reason that a retry cannot fix.
    pub async fn submit(&self, spec: &JobSpec, key: Option<&str>) -> crate::Result<JobHandle> {
        self.submit_until(spec, key, std::future::pending()).await
    }

    /// Like [`TenacitySubmitter::submit`], but gives up once `interrupt` completes.
    ///
    /// The job of the current attempt is cancelled (if it is still queued or running)
    /// before [`TenacityError::Interrupted`] is returned.
    pub async fn submit_until<F>(
        &self,
        spec: &JobSpec,
        key: Option<&str>,
        interrupt: F,
    ) -> crate::Result<JobHandle>
    where
        F: Future<Output = ()>,
    {
        let mut interrupt = std::pin::pin!(interrupt);
        let signature = JobSignature::new(&spec.command, key);
        let mut request = self.initial_request(spec, &signature)?;

        loop {
            let mut attempt = spec.clone();
            attempt.walltime = Some(request.walltime);
            attempt.memory = Some(request.memory);

            let job = submit_job(&self.executor, &attempt).await?;
            let interval = self.config.poll_interval;
            let status = job
                .ensure_termination(async |job: &JobHandle| {
                    tokio::select! {
                        status = job.wait_for_completion(interval) => status,
                        _ = &mut interrupt => {
                            log::warn!("Slurm job {}: interrupted", job.id());
                            Err(TenacityError::Interrupted)
                        }
                    }
                })
                .await?;

            match next_step(&self.config, request, &status) {
                NextStep::Resubmit(next) => {
                    match status {
                        SimplifiedStatus::FailedMem => log::info!(
                            "Job {signature:?} failed for memory; expanding to {}",
                            next.memory
                        ),
                        SimplifiedStatus::FailedTime => log::info!(
                            "Job {signature:?} failed for time; expanding to {}",
                            format_slurm_duration(&next.walltime)
                        ),
                        _ => log::info!("Job {signature:?} failed with {status}; retrying"),
                    }
                    request = next;
                }
                NextStep::Finish => {
                    log::info!("Job {signature:?} succeeded");
                    self.remember_allocation(&job, signature).await?;
                    return Ok(job);
                }
                NextStep::Abort => return Err(job_failure(&job, status).await),
            }
        }
    }

    /// Stores the observed resource usage of a successful job, scaled by the safety factor.
    async fn remember_allocation(&self, job: &JobHandle, signature: JobSignature) -> crate::Result<()> {
        let walltime = scale_duration(job.walltime().await?, self.config.safety_factor);
        let memory = job
            .memory()
            .await?
            .map(|memory| scale_memory(memory, self.config.safety_factor));
        let record = AllocationRecord { walltime, memory };
        log::info!("Saving parameters for {signature:?}: {record:?}");
        self.cache.transaction(|allocations| {
            allocations.insert(signature, record);
            Ok(())
        })
    }

    /// Blocking version of [`TenacitySubmitter::submit`].
    ///
    /// Must not be called from within an async runtime.
    pub fn submit_blocking(&self, spec: &JobSpec, key: Option<&str>) -> crate::Result<JobHandle> {
        block_on(self.submit(spec, key), "submit")?
    }
}

async fn job_failure(job: &JobHandle, status: SimplifiedStatus) -> TenacityError {
    let stdout = job
        .read_stdout()
        .await
        .unwrap_or_else(|error| format!("<cannot read stdout: {error}>"));
    let stderr = job
        .read_stderr()
        .await
        .unwrap_or_else(|error| format!("<cannot read stderr: {error}>"));
    TenacityError::JobFailed {
        job_id: job.id(),
        status,
        stdout,
        stderr,
    }
}
