//! Process Execution Module
//!
//! Renders staged processes and runs them on a backend.
//!
//! # Architecture
//!
//! - [`render`]: Binds declarations into the script environment
//! - [`executor`]: The [`Executor`] interface, results and the backend factory
//! - [`local`]: Child-process backend
//! - [`cluster`]: Batch backend over a pluggable [`Scheduler`]
//! - [`slurm`]: Slurm implementation of [`Scheduler`]
//! - [`resources`]: Batch resource requests

pub mod cluster;
pub mod executor;
pub mod local;
pub mod render;
pub mod resources;
pub mod slurm;

pub use cluster::{
    ClusterJob, ClusterRunner, JobHandle, JobScript, JobState, Scheduler, SchedulerStatus,
    DEFAULT_POLL_INTERVAL,
};
pub use executor::{
    effective_staging_mode, executor, resolve_outputs, ExecutionResult, Executor,
    GenericExecutor,
};
pub use local::{CancelHandle, LocalRunner};
pub use render::{render, shell_quote, RenderedScript, ScriptRenderer};
pub use resources::{MailType, Megabytes, Memory, ResourceRequest, WallTime};
pub use slurm::SlurmScheduler;
