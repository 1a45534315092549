//! Execution Error Taxonomy
//!
//! One error type per failure concern, aggregated by [`ExecutionError`]
//! which is what [`Executor::execute`](crate::Executor::execute) returns.
//! Every variant carries enough context (key name, exit code, captured
//! output, deadline) to diagnose a failure without re-running.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// An input could not be read or the staging directory could not be built.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("input '{key}' does not exist: {}", .path.display())]
    MissingInput { key: String, path: PathBuf },

    #[error("input '{key}' at {} is not readable: {source}", .path.display())]
    UnreadableInput {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create staging directory {}: {source}", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stage input '{key}' into {}: {source}", .path.display())]
    Materialize {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write staging manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not allocate a unique staging directory for '{name}' under {}", .root.display())]
    Exhausted { name: String, root: PathBuf },
}

/// The script template is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("process '{process}' has an empty script")]
    EmptyScript { process: String },

    #[error("script of process '{process}' contains a NUL byte at offset {offset}")]
    NulByte { process: String, offset: usize },

    #[error("shebang of process '{process}' names no interpreter")]
    MissingInterpreter { process: String },

    #[error("input '{key}' of process '{process}' has no staged entry")]
    UnstagedInput { process: String, key: String },
}

/// The backend refused to accept a job.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("failed to launch {command}: {source}")]
    Unavailable {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("scheduler rejected the job (exit code {code:?}): {stderr}")]
    Rejected { code: Option<i32>, stderr: String },

    #[error("could not parse a job id from scheduler output: {output:?}")]
    UnparsableJobId { output: String },

    #[error("failed to write job launcher {}: {source}", .path.display())]
    Launcher {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A status or cancel request to the scheduler failed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with code {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// The script ran but did not exit successfully.
#[derive(Debug, Clone)]
pub struct RunError {
    /// Name of the process that failed
    pub process: String,
    /// Exit status, `None` when terminated by a signal or unknown
    pub exit_code: Option<i32>,
    /// Tail of the captured standard output
    pub stdout: String,
    /// Tail of the captured standard error
    pub stderr: String,
    /// Backend-specific detail (signal, scheduler state)
    pub diagnostic: Option<String>,
    /// Staging directory kept for inspection
    pub staging_dir: PathBuf,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process '{}' failed", self.process)?;
        match self.exit_code {
            Some(code) => write!(f, " with exit code {}", code)?,
            None => write!(f, " without an exit code")?,
        }
        if let Some(ref diagnostic) = self.diagnostic {
            write!(f, " ({})", diagnostic)?;
        }
        write!(f, "; staging directory: {}", self.staging_dir.display())?;

        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, "\nstderr:\n{}", stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}

/// Caller asked for an output key the process never declared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("output '{key}' is not declared by process '{process}'")]
pub struct UndeclaredOutput {
    pub process: String,
    pub key: String,
}

/// Invalid executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown executor '{0}' (expected one of: default, local, cluster, slurm)")]
    UnknownExecutor(String),

    #[error("invalid staging mode '{0}' (expected 'copy' or 'in-place')")]
    InvalidStagingMode(String),
}

/// Any failure of a single `execute` call.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("job submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("job {job_id} did not reach a terminal state within {deadline:?}")]
    Timeout { job_id: String, deadline: Duration },

    #[error("declared output '{key}' was not produced at {}", .path.display())]
    OutputMissing { key: String, path: PathBuf },

    #[error("scheduler query failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("execution cancelled; staging directory kept at {}", .staging_dir.display())]
    Cancelled { staging_dir: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ExecutionError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Exit code of a failed run, if the failure was a run failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Run(run) => run.exit_code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_error(exit_code: Option<i32>) -> RunError {
        RunError {
            process: "align".to_string(),
            exit_code,
            stdout: String::new(),
            stderr: "bowtie2: index not found\n".to_string(),
            diagnostic: None,
            staging_dir: PathBuf::from("/work/align-1-0"),
        }
    }

    #[test]
    fn test_run_error_display() {
        let message = run_error(Some(3)).to_string();
        assert!(message.contains("exit code 3"));
        assert!(message.contains("/work/align-1-0"));
        assert!(message.contains("index not found"));
    }

    #[test]
    fn test_run_error_display_signal() {
        let mut error = run_error(None);
        error.diagnostic = Some("terminated by signal 9".to_string());
        let message = error.to_string();
        assert!(message.contains("without an exit code"));
        assert!(message.contains("signal 9"));
    }

    #[test]
    fn test_execution_error_exit_code() {
        let error = ExecutionError::from(run_error(Some(3)));
        assert_eq!(error.exit_code(), Some(3));

        let missing = ExecutionError::OutputMissing {
            key: "b".to_string(),
            path: PathBuf::from("b.txt"),
        };
        assert_eq!(missing.exit_code(), None);
    }

    #[test]
    fn test_output_missing_names_key() {
        let error = ExecutionError::OutputMissing {
            key: "report".to_string(),
            path: PathBuf::from("/work/qc/report.html"),
        };
        assert!(error.to_string().contains("'report'"));
    }

    #[test]
    fn test_timeout_mentions_deadline() {
        let error = ExecutionError::Timeout {
            job_id: "4242".to_string(),
            deadline: Duration::from_secs(1),
        };
        let message = error.to_string();
        assert!(message.contains("4242"));
        assert!(message.contains("1s"));
    }
}
