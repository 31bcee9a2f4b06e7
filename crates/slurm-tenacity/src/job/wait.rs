use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::error::{TenacityError, usage_error};
use crate::job::JobHandle;
use crate::job::status::SimplifiedStatus;

/// How often `sacct` is queried while waiting for a job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

type StatusEvent = crate::Result<SimplifiedStatus>;

/// Periodically polls the status of a job in a background task and reports every status
/// change through a channel.
///
/// The polling task stops after a terminal status (or a query error) and it is aborted when
/// the watch is dropped. Neither of these cancels the job itself.
pub struct StatusWatch {
    receiver: mpsc::UnboundedReceiver<StatusEvent>,
    task: JoinHandle<()>,
}

impl StatusWatch {
    /// Starts polling. The first query happens after one `interval`.
    pub fn spawn(job: JobHandle, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_status(job, interval, sender));
        Self { receiver, task }
    }

    /// Waits for the next status change, or returns `None` if polling has finished.
    pub async fn next_change(&mut self) -> Option<StatusEvent> {
        self.receiver.recv().await
    }

    pub async fn wait_until_terminal(mut self) -> crate::Result<SimplifiedStatus> {
        while let Some(event) = self.next_change().await {
            let status = event?;
            if status.is_terminal() {
                return Ok(status);
            }
        }
        Err(TenacityError::GenericError(
            "Status polling stopped before the job finished".to_string(),
        ))
    }
}

impl Drop for StatusWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_status(
    job: JobHandle,
    interval: Duration,
    sender: mpsc::UnboundedSender<StatusEvent>,
) {
    let mut last: Option<SimplifiedStatus> = None;
    loop {
        tokio::time::sleep(interval).await;
        match job.status().await {
            Ok(status) => {
                let terminal = status.is_terminal();
                if last.as_ref() != Some(&status) {
                    last = Some(status.clone());
                    if sender.send(Ok(status)).is_err() {
                        return;
                    }
                }
                if terminal {
                    return;
                }
            }
            Err(error) => {
                let _ = sender.send(Err(error));
                return;
            }
        }
    }
}

impl JobHandle {
    /// Waits until the job completes or fails, querying its status every `interval`.
    ///
    /// Other tasks can run while this waits. Dropping the future stops the polling but does
    /// not cancel the job; use [`JobHandle::ensure_termination`] for that.
    pub async fn wait_for_completion(&self, interval: Duration) -> crate::Result<SimplifiedStatus> {
        log::info!(
            "Slurm job {}: checking sacct every {:.1}s",
            self.id(),
            interval.as_secs_f64()
        );
        StatusWatch::spawn(self.clone(), interval)
            .wait_until_terminal()
            .await
    }

    /// Blocking version of [`JobHandle::wait_for_completion`], which puts the calling
    /// thread to sleep between queries.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_for_completion_blocking(
        &self,
        interval: Duration,
    ) -> crate::Result<SimplifiedStatus> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return usage_error(
                "Blocking wait cannot be used inside an async runtime, use `wait_for_completion`"
                    .to_string(),
            );
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        log::info!(
            "Slurm job {}: checking sacct every {:.1}s",
            self.id(),
            interval.as_secs_f64()
        );
        loop {
            std::thread::sleep(interval);
            let status = runtime.block_on(self.status())?;
            if status.is_terminal() {
                return Ok(status);
            }
        }
    }
}
