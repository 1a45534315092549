//! Local Execution
//!
//! Runs the rendered script as a child process of the calling thread, with
//! the staging directory as working directory and the rendered variables
//! added to the inherited environment.
//!
//! Standard output and error go to `.stagerun.out` and `.stagerun.err` in
//! the staging directory; on failure their tails are attached to the error.

use std::fs::File;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::executor::{read_tail, Executor};
use super::render::RenderedScript;
use crate::environment::launch_argv;
use crate::error::{ExecutionError, RunError};
use crate::monitoring::{ExecutionLog, LogEvent, ResourceMonitor, ResourceUsage};
use crate::process::ProcessSpec;
use crate::staging::{
    StagingDirectory, StagingManager, StagingMode, SCRIPT_FILE, STDERR_FILE, STDOUT_FILE,
};

/// Interval between two child status checks.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared flag requesting termination of a runner's executions.
///
/// Setting it kills every child currently running under the runner it was
/// obtained from, and any started later, until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears a previous request so new executions can run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Executes processes as local child processes.
///
/// # Example
///
/// ```rust,no_run
/// use stagerun::{Executor, LocalRunner, ProcessSpec, StagingMode};
///
/// let runner = LocalRunner::new().with_staging_mode(StagingMode::Copy);
/// let process = ProcessSpec::builder("count")
///     .input("reads", "reads.fastq")
///     .output("count", "count.txt")
///     .script(r#"wc -l < "$reads" > "$count""#)
///     .build()?;
///
/// let result = runner.execute(&process)?;
/// println!("{}", result.output("count")?.display());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalRunner {
    staging_mode: StagingMode,
    manager: StagingManager,
    poll_interval: Duration,
    cancel: CancelHandle,
}

impl LocalRunner {
    /// Creates a runner staging under `STAGERUN_WORKDIR` with in-place staging.
    pub fn new() -> Self {
        Self {
            staging_mode: StagingMode::default(),
            manager: StagingManager::from_env(),
            poll_interval: WAIT_POLL_INTERVAL,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_staging_manager(mut self, manager: StagingManager) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle cancelling this runner's executions.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn spawn_failure(program: &str, e: io::Error) -> ExecutionError {
        ExecutionError::io(format!("failed to spawn {}", program), e)
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalRunner {
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
        let argv = launch_argv(
            process.container(),
            script.command(&staging.file(SCRIPT_FILE)),
            staging.path(),
            script.env_keys(),
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(Self::spawn_failure(
                "script",
                io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            ));
        };

        let capture = |name: &str| {
            let path = staging.file(name);
            File::create(&path).map_err(|e| {
                ExecutionError::io(format!("failed to create {}", path.display()), e)
            })
        };
        let stdout = capture(STDOUT_FILE)?;
        let stderr = capture(STDERR_FILE)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(staging.path())
            .envs(&script.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let mut child = spawn(&mut command).map_err(|e| Self::spawn_failure(program, e))?;

        info!("Started '{}' (pid {})", process.name(), child.id());
        log.record(LogEvent::Started, format!("pid {}", child.id()));
        let mut monitor = ResourceMonitor::for_pid(child.id());

        let status = loop {
            if self.cancel.is_cancelled() {
                warn!("Cancelling '{}' (pid {})", process.name(), child.id());
                if let Err(e) = child.kill() {
                    warn!("Failed to kill pid {}: {}", child.id(), e);
                }
                let _ = child.wait();
                return Err(ExecutionError::Cancelled {
                    staging_dir: staging.path().to_path_buf(),
                });
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    monitor.sample();
                    thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecutionError::io("failed to wait for script", e));
                }
            }
        };

        let usage = monitor.usage();
        debug!("'{}' finished with {}: {}", process.name(), status, usage);

        if status.success() {
            return Ok(Some(usage));
        }

        Err(RunError {
            process: process.name().to_string(),
            exit_code: status.code(),
            stdout: read_tail(&staging.file(STDOUT_FILE)),
            stderr: read_tail(&staging.file(STDERR_FILE)),
            diagnostic: describe_signal(&status),
            staging_dir: staging.path().to_path_buf(),
        }
        .into())
    }
}

/// ETXTBSY: another thread forked while the script file was still open.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

fn spawn(command: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS => {
                debug!("Script busy, retrying spawn (attempt {})", attempt);
                thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn describe_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| format!("terminated by signal {}", signal))
}

#[cfg(not(unix))]
fn describe_signal(_status: &ExitStatus) -> Option<String> {
    None
}
