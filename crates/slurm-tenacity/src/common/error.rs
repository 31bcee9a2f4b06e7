use thiserror::Error;

use crate::JobId;
use crate::job::status::SimplifiedStatus;

#[derive(Debug, Error)]
pub enum TenacityError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Submission error: {0}")]
    Submission(String),
    #[error("Slurm job {job_id} failed with {status}\n{stdout}\n{stderr}")]
    JobFailed {
        job_id: JobId,
        status: SimplifiedStatus,
        stdout: String,
        stderr: String,
    },
    #[error("Usage error: {0}")]
    Usage(String),
    #[error("Interrupted before the job finished")]
    Interrupted,
    #[error("{0}")]
    Command(#[from] CommandError),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

/// A command that exited with a nonzero code while its exit code was checked.
#[derive(Debug, Error)]
#[error("Command returned non-zero exit status {code}\ncommand: {command}{}{}", indent_output("stdout", .stdout), indent_output("stderr", .stderr))]
pub struct CommandError {
    pub command: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

fn indent_output(name: &str, output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }
    let mut result = format!("\n{name}:");
    for line in output.lines() {
        result.push_str("\n  ");
        result.push_str(line);
    }
    result
}

impl From<serde_json::error::Error> for TenacityError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for TenacityError {
    fn from(error: toml::de::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

impl From<anyhow::Error> for TenacityError {
    fn from(error: anyhow::Error) -> Self {
        Self::ParseError(format!("{error:?}"))
    }
}

impl From<tempfile::PersistError> for TenacityError {
    fn from(error: tempfile::PersistError) -> Self {
        Self::IoError(error.error)
    }
}

pub fn usage_error<T>(message: String) -> crate::Result<T> {
    Err(TenacityError::Usage(message))
}
