//! Cluster Execution
//!
//! Runs a staged process as a batch job through a [`Scheduler`].
//!
//! # Job State Machine
//!
//! ```text
//! Pending --submit--> Submitted --poll--> Running --poll--> Completed
//!    |                    |                  |         \--> Failed
//!    +-------cancel-------+-------cancel-----+------------> Cancelled
//! ```
//!
//! The executor writes a launcher script into the staging directory that
//! exports the rendered environment, loads environment modules, changes
//! into the staging directory and runs the script. The scheduler only ever
//! sees the launcher.
//!
//! Waiting is a polling loop: the only suspension point is the sleep between
//! two status queries. Leaving the loop with an error (deadline expired or a
//! failed status query) cancels the job first, best-effort.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::executor::{read_tail, Executor};
use super::render::{shell_quote, RenderedScript};
use super::resources::ResourceRequest;
use crate::environment::launch_argv;
use crate::error::{ExecutionError, RunError, SchedulerError, SubmissionError};
use crate::monitoring::{ExecutionLog, LogEvent, ResourceUsage};
use crate::process::ProcessSpec;
use crate::staging::{
    StagingDirectory, StagingManager, StagingMode, LAUNCHER_FILE, SCRIPT_FILE, STDERR_FILE,
    STDOUT_FILE,
};

/// Default interval between two status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a scheduler needs to accept a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    /// Executable launcher script
    pub launcher: PathBuf,
    /// Directory the job runs in and writes its streams to
    pub workdir: PathBuf,
    /// Job name shown by the scheduler
    pub name: String,
    pub resources: ResourceRequest,
}

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job status as reported by a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStatus {
    Pending,
    Running,
    Completed { exit_code: i32 },
    Failed { exit_code: Option<i32>, reason: String },
    Cancelled,
    /// The scheduler has no record of the job
    Unknown,
}

/// Submit/poll/cancel contract of a batch system.
///
/// Any implementation is pluggable into [`ClusterRunner`].
pub trait Scheduler: Send + Sync {
    /// Hands the job to the scheduler.
    fn submit(&self, job: &JobScript) -> Result<JobHandle, SubmissionError>;

    /// Queries the current status without blocking on the job.
    fn status(&self, handle: &JobHandle) -> Result<SchedulerStatus, SchedulerError>;

    /// Requests termination of the job.
    fn cancel(&self, handle: &JobHandle) -> Result<(), SchedulerError>;
}

/// Engine-side state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Returns true once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// One batch job tracked through its lifecycle.
#[derive(Debug, Clone)]
pub struct ClusterJob {
    script: JobScript,
    handle: Option<JobHandle>,
    state: JobState,
    exit_code: Option<i32>,
    reason: Option<String>,
}

impl ClusterJob {
    /// A job that has not been submitted yet.
    pub fn pending(script: JobScript) -> Self {
        Self {
            script,
            handle: None,
            state: JobState::Pending,
            exit_code: None,
            reason: None,
        }
    }

    pub fn script(&self) -> &JobScript {
        &self.script
    }

    /// Scheduler handle, once submitted.
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Exit code reported by the scheduler, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Scheduler-provided failure detail.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    fn id(&self) -> &str {
        self.handle.as_ref().map(JobHandle::id).unwrap_or("<unsubmitted>")
    }
}

/// Executes processes as batch jobs on a cluster scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stagerun::execution::{ClusterRunner, ResourceRequest, SlurmScheduler, WallTime};
/// use stagerun::{Executor, ProcessSpec, StagingMode};
///
/// let runner = ClusterRunner::new(SlurmScheduler::new())
///     .with_resources(ResourceRequest::new().with_cpus(4).with_time(WallTime::from_hours(2)))
///     .with_module("samtools/1.17")
///     .with_deadline(Duration::from_secs(3600))
///     .with_staging_mode(StagingMode::Copy);
///
/// let process = ProcessSpec::builder("sort")
///     .input("bam", "sample.bam")
///     .output("sorted", "sorted.bam")
///     .script(r#"samtools sort -o "$sorted" "$bam""#)
///     .build()?;
///
/// let result = runner.execute(&process)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ClusterRunner<S: Scheduler> {
    scheduler: S,
    staging_mode: StagingMode,
    manager: StagingManager,
    poll_interval: Duration,
    deadline: Option<Duration>,
    modules: Vec<String>,
    resources: ResourceRequest,
}

impl<S: Scheduler> ClusterRunner<S> {
    /// Creates a runner staging under `STAGERUN_WORKDIR` with in-place staging.
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            staging_mode: StagingMode::default(),
            manager: StagingManager::from_env(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            modules: Vec::new(),
            resources: ResourceRequest::default(),
        }
    }

    pub fn with_staging_manager(mut self, manager: StagingManager) -> Self {
        self.manager = manager;
        self
    }

    /// Sets the interval between two status queries.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds how long `execute` waits for a terminal state.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Adds an environment module loaded before the script runs.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    pub fn with_modules<I, M>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.modules.extend(modules.into_iter().map(Into::into));
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    /// Hands a pending job to the scheduler.
    ///
    /// Submitting a job that is no longer pending is a no-op.
    pub fn submit(&self, job: &mut ClusterJob) -> Result<(), SubmissionError> {
        if job.state != JobState::Pending {
            debug!("Job {} already {}, not resubmitting", job.id(), job.state);
            return Ok(());
        }

        let handle = self.scheduler.submit(&job.script)?;
        info!("Submitted '{}' as job {}", job.script.name, handle);
        job.handle = Some(handle);
        job.state = JobState::Submitted;
        Ok(())
    }

    /// Performs one status query and advances the job's state.
    pub fn poll(&self, job: &mut ClusterJob) -> Result<JobState, SchedulerError> {
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        let Some(handle) = job.handle.as_ref() else {
            return Ok(job.state);
        };

        let previous = job.state;
        match self.scheduler.status(handle)? {
            SchedulerStatus::Pending => {}
            SchedulerStatus::Running => job.state = JobState::Running,
            SchedulerStatus::Completed { exit_code } => {
                job.exit_code = Some(exit_code);
                if exit_code == 0 {
                    job.state = JobState::Completed;
                } else {
                    job.state = JobState::Failed;
                    job.reason = Some(format!("exited with code {}", exit_code));
                }
            }
            SchedulerStatus::Failed { exit_code, reason } => {
                job.exit_code = exit_code;
                job.reason = Some(reason);
                job.state = JobState::Failed;
            }
            SchedulerStatus::Cancelled => job.state = JobState::Cancelled,
            SchedulerStatus::Unknown => {
                job.reason = Some("job no longer known to the scheduler".to_string());
                job.state = JobState::Failed;
            }
        }

        if job.state != previous {
            info!("Job {}: {} -> {}", job.id(), previous, job.state);
        }
        Ok(job.state)
    }

    /// Polls until the job is terminal or `deadline` expires.
    pub fn wait(
        &self,
        job: &mut ClusterJob,
        deadline: Option<Duration>,
    ) -> Result<JobState, ExecutionError> {
        let started = Instant::now();

        loop {
            match self.poll(job) {
                Ok(state) if state.is_terminal() => return Ok(state),
                Ok(_) => {}
                Err(e) => {
                    self.cancel_quietly(job);
                    return Err(e.into());
                }
            }

            let mut sleep_for = self.poll_interval;
            if let Some(deadline) = deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    warn!("Job {} exceeded its deadline of {:?}", job.id(), deadline);
                    self.cancel_quietly(job);
                    return Err(ExecutionError::Timeout {
                        job_id: job.id().to_string(),
                        deadline,
                    });
                }
                sleep_for = sleep_for.min(deadline - elapsed);
            }
            thread::sleep(sleep_for);
        }
    }

    /// Requests termination of the job.
    ///
    /// Cancelling a terminal job is a no-op; a job never submitted is
    /// marked cancelled without contacting the scheduler.
    pub fn cancel(&self, job: &mut ClusterJob) -> Result<(), SchedulerError> {
        if job.state.is_terminal() {
            debug!("Job {} already {}, nothing to cancel", job.id(), job.state);
            return Ok(());
        }

        if let Some(handle) = job.handle.as_ref() {
            self.scheduler.cancel(handle)?;
            info!("Cancelled job {}", handle);
        }
        job.state = JobState::Cancelled;
        Ok(())
    }

    fn cancel_quietly(&self, job: &mut ClusterJob) {
        if let Err(e) = self.cancel(job) {
            warn!("Failed to cancel job {}: {}", job.id(), e);
        }
    }

    /// Writes `.stagerun.launcher` into the staging directory.
    pub fn write_launcher(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
        script: &RenderedScript,
    ) -> Result<PathBuf, SubmissionError> {
        let path = staging.file(LAUNCHER_FILE);
        let content = self.launcher_content(process, staging.path(), script);

        let written = fs::write(&path, content).and_then(|()| {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
            }
            Ok(())
        });
        written.map_err(|e| SubmissionError::Launcher {
            path: path.clone(),
            source: e,
        })?;

        debug!("Wrote launcher {}", path.display());
        Ok(path)
    }

    fn launcher_content(
        &self,
        process: &ProcessSpec,
        workdir: &Path,
        script: &RenderedScript,
    ) -> String {
        let mut content = String::from("#!/bin/bash\nset -euo pipefail\n\n");
        content.push_str(&script.exports());

        if !self.modules.is_empty() {
            content.push('\n');
            for module in &self.modules {
                content.push_str(&format!("module load {}\n", module));
            }
        }

        let argv = launch_argv(
            process.container(),
            script.command(&workdir.join(SCRIPT_FILE)),
            workdir,
            script.env_keys(),
        );
        let command: Vec<String> = argv.iter().map(|arg| shell_quote(arg)).collect();

        content.push_str(&format!("\ncd {}\n", shell_quote(&workdir.display().to_string())));
        content.push_str(&format!("exec {}\n", command.join(" ")));
        content
    }
}

impl<S: Scheduler> Executor for ClusterRunner<S> {
    fn staging_mode(&self) -> StagingMode {
        self.staging_mode
    }

    fn set_staging_mode(&mut self, mode: StagingMode) {
        self.staging_mode = mode;
    }

    fn staging_manager(&self) -> &StagingManager {
        &self.manager
    }

    fn run(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
        script: &RenderedScript,
        log: &mut ExecutionLog,
    ) -> Result<Option<ResourceUsage>, ExecutionError> {
        let launcher = self.write_launcher(process, staging, script)?;

        let mut job = ClusterJob::pending(JobScript {
            launcher,
            workdir: staging.path().to_path_buf(),
            name: process.name().to_string(),
            resources: self.resources.clone(),
        });
        self.submit(&mut job)?;
        log.record(
            LogEvent::Submitted {
                job_id: job.id().to_string(),
            },
            "",
        );

        let state = self.wait(&mut job, self.deadline)?;
        log.record(
            LogEvent::StateChanged {
                state: state.to_string(),
            },
            job.reason().unwrap_or_default(),
        );

        match state {
            JobState::Completed => Ok(None),
            JobState::Cancelled => Err(ExecutionError::Cancelled {
                staging_dir: staging.path().to_path_buf(),
            }),
            _ => Err(RunError {
                process: process.name().to_string(),
                exit_code: job.exit_code(),
                stdout: read_tail(&staging.file(STDOUT_FILE)),
                stderr: read_tail(&staging.file(STDERR_FILE)),
                diagnostic: Some(format!(
                    "job {}: {}",
                    job.id(),
                    job.reason().unwrap_or("failed")
                )),
                staging_dir: staging.path().to_path_buf(),
            }
            .into()),
        }
    }
}
