pub mod cache;
pub mod common;
pub mod config;
pub mod executor;
pub mod job;
pub mod submit;
pub mod tenacity;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::TenacityError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;

/// Identifier assigned to a job by Slurm.
pub type JobId = u64;

// Reexports
pub use cache::{AllocationCache, AllocationRecord, JobSignature};
pub use config::TenacityConfig;
pub use executor::{Executor, LocalExecutor, SshExecutor};
pub use job::JobHandle;
pub use job::guard::TerminationGuard;
pub use job::status::SimplifiedStatus;
pub use submit::{JobSpec, JobSpecBuilder, submit_job};
pub use tenacity::TenacitySubmitter;
