//! stagerun - Staged Process Execution Engine
//!
//! Runs one declared unit of work (a *process*) at a time: its inputs are
//! materialized into an isolated staging directory, its shell script runs
//! on a local or cluster backend, and its declared outputs are resolved
//! back into concrete paths.
//!
//! # Architecture
//!
//! - [`process`]: Process declarations and their validation
//! - [`staging`]: Unique per-execution directories and input materialization
//! - [`execution`]: Script rendering, the [`Executor`] interface and its backends
//! - [`environment`]: Container and conda wrapping of the script
//! - [`monitoring`]: Per-execution event log and resource sampling
//! - [`error`]: Error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use stagerun::{executor, Executor, ProcessSpec, StagingMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let process = ProcessSpec::builder("align")
//!         .input("reads", "data/reads.fastq")
//!         .output("alignment", "aligned.sam")
//!         .arg("threads", 4)
//!         .script(r#"bowtie2 -p "$threads" -U "$reads" -S "$alignment""#)
//!         .build()?;
//!
//!     let runner = executor("default")?.with_staging_mode(StagingMode::Copy);
//!     let result = runner.execute(&process)?;
//!
//!     println!("alignment: {}", result.output("alignment")?.display());
//!     println!("staged in: {}", result.staging_dir().display());
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod process;
pub mod staging;

// Re-export commonly used types
pub use environment::Container;
pub use error::{
    ConfigError, ExecutionError, RenderError, RunError, SchedulerError, StagingError,
    SubmissionError, UndeclaredOutput,
};
pub use execution::{
    executor, CancelHandle, ClusterRunner, ExecutionResult, Executor, GenericExecutor,
    LocalRunner, SlurmScheduler,
};
pub use process::{ArgValue, ProcessSpec, ValidationError};
pub use staging::{StagingDirectory, StagingManager, StagingMode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "stagerun";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "stagerun");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_module_exports_process() {
        let process = ProcessSpec::builder("test").script("echo test").build().unwrap();
        assert_eq!(process.name(), "test");
    }

    #[test]
    fn test_module_exports_executor() {
        let runner = executor("default").unwrap();
        assert_eq!(runner.staging_mode(), StagingMode::InPlace);
    }
}
