use crate::common::error::usage_error;
use crate::common::utils::runtime::block_on;
use crate::job::JobHandle;

/// Cancels a job that is still queued or running when the guard goes out of scope.
///
/// The normal way to leave the scope is [`TerminationGuard::release`] (or
/// [`TerminationGuard::release_blocking`] outside of an async runtime), which performs the
/// check (and the cancellation, if needed) before returning. If the guard is dropped without
/// being released, e.g. because the owning future was dropped or a panic unwound through it,
/// the same check is spawned onto the current tokio runtime. Without a runtime, it is
/// performed synchronously on a private one.
pub struct TerminationGuard {
    job: JobHandle,
    armed: bool,
}

impl TerminationGuard {
    pub fn new(job: JobHandle) -> Self {
        Self { job, armed: true }
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Leaves the guarded scope. Returns `true` if the job had to be cancelled.
    pub async fn release(mut self) -> crate::Result<bool> {
        self.armed = false;
        self.job.terminate().await
    }

    /// Blocking version of [`TerminationGuard::release`].
    ///
    /// Must not be called from within an async runtime; the guard stays armed in that case.
    pub fn release_blocking(mut self) -> crate::Result<bool> {
        let cancelled = block_on(self.job.terminate(), "release")?;
        self.armed = false;
        cancelled
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        if !self.armed || !self.job.is_waiting() {
            return;
        }
        let job = self.job.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = job.terminate().await {
                        log::error!("Slurm job {}: cannot be canceled: {error}", job.id());
                    }
                });
            }
            Err(_) => {
                if let Err(error) = block_on(job.terminate(), "release").and_then(|r| r) {
                    log::error!("Slurm job {}: cannot be canceled: {error}", job.id());
                }
            }
        }
    }
}

fn merge_cleanup<T>(
    job: &JobHandle,
    result: crate::Result<T>,
    cleanup: crate::Result<bool>,
) -> crate::Result<T> {
    match (result, cleanup) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(error)) => Err(error),
        (Err(error), Ok(_)) => Err(error),
        (Err(error), Err(cleanup_error)) => {
            log::error!(
                "Slurm job {}: cannot be canceled: {cleanup_error}",
                job.id()
            );
            Err(error)
        }
    }
}

impl JobHandle {
    /// Runs `body` and makes sure the job does not outlive it.
    ///
    /// When `body` finishes, successfully or with an error, the job is cancelled if it is
    /// still queued or running. No cancellation is issued for a job that already finished.
    pub async fn ensure_termination<F, T>(&self, body: F) -> crate::Result<T>
    where
        F: AsyncFnOnce(&JobHandle) -> crate::Result<T>,
    {
        let guard = TerminationGuard::new(self.clone());
        let result = body(self).await;
        let cleanup = guard.release().await;
        merge_cleanup(self, result, cleanup)
    }

    /// Blocking version of [`JobHandle::ensure_termination`].
    ///
    /// Must not be called from within an async runtime, in which case `body` is not run.
    pub fn ensure_termination_blocking<F, T>(&self, body: F) -> crate::Result<T>
    where
        F: FnOnce(&JobHandle) -> crate::Result<T>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return usage_error(
                "Blocking scope cannot be used inside an async runtime, use `ensure_termination`"
                    .to_string(),
            );
        }
        let guard = TerminationGuard::new(self.clone());
        let result = body(self);
        let cleanup = guard.release_blocking();
        merge_cleanup(self, result, cleanup)
    }
}
