//! Slurm Scheduler
//!
//! [`Scheduler`] implementation driving the Slurm command-line tools:
//!
//! | Operation | Command                                         |
//! |-----------|-------------------------------------------------|
//! | submit    | `sbatch --parsable ... <launcher>`              |
//! | status    | `squeue -h -j <id> -o %T`, then `sacct` once the job left the queue |
//! | cancel    | `scancel <id>`                                  |

use std::process::{Command, Output};

use log::debug;

use super::cluster::{JobHandle, JobScript, Scheduler, SchedulerStatus};
use crate::error::{SchedulerError, SubmissionError};
use crate::staging::{STDERR_FILE, STDOUT_FILE};

/// Submits jobs through `sbatch` and tracks them with `squeue`/`sacct`.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

impl SlurmScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, job: &JobScript) -> Result<JobHandle, SubmissionError> {
        let mut command = Command::new("sbatch");
        command
            .arg("--parsable")
            .arg(format!("--job-name={}", job.name))
            .arg(format!("--chdir={}", job.workdir.display()))
            .arg("-o")
            .arg(job.workdir.join(STDOUT_FILE))
            .arg("-e")
            .arg(job.workdir.join(STDERR_FILE))
            .arg("--open-mode=append")
            .args(job.resources.to_sbatch_args())
            .arg(&job.launcher)
            .current_dir(&job.workdir);

        debug!("Running {:?}", command);
        let output = command
            .output()
            .map_err(|e| SubmissionError::Unavailable {
                command: "sbatch".to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(SubmissionError::Rejected {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_job_id(&stdout)
            .map(JobHandle::new)
            .ok_or_else(|| SubmissionError::UnparsableJobId {
                output: stdout.trim().to_string(),
            })
    }

    fn status(&self, handle: &JobHandle) -> Result<SchedulerStatus, SchedulerError> {
        // Finished jobs leave the queue; only accounting knows their outcome.
        let queue = run("squeue", &["-h", "-j", handle.id(), "-o", "%T"]);
        if let Ok(output) = &queue {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(status) = parse_queue_state(&stdout) {
                    return Ok(status);
                }
            }
        }

        let output = checked(
            "sacct",
            run(
                "sacct",
                &["-n", "-P", "-X", "-j", handle.id(), "-o", "State,ExitCode"],
            )?,
        )?;
        Ok(parse_accounting(&String::from_utf8_lossy(&output.stdout)))
    }

    fn cancel(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        checked("scancel", run("scancel", &[handle.id()])?)?;
        Ok(())
    }
}

fn run(program: &str, args: &[&str]) -> Result<Output, SchedulerError> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SchedulerError::Spawn {
            command: program.to_string(),
            source: e,
        })
}

fn checked(program: &str, output: Output) -> Result<Output, SchedulerError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(SchedulerError::Command {
            command: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Extracts the job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();

    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_');
    valid.then(|| id.to_string())
}

/// Maps a `squeue -o %T` state to a live status.
///
/// Returns `None` for empty output and for states that need accounting data
/// to be interpreted.
pub fn parse_queue_state(stdout: &str) -> Option<SchedulerStatus> {
    let state = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => {
            Some(SchedulerStatus::Pending)
        }
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STAGE_OUT" | "SIGNALING" | "RESIZING"
        | "STOPPED" => Some(SchedulerStatus::Running),
        _ => None,
    }
}

/// Interprets `sacct -n -P -X -o State,ExitCode` output.
pub fn parse_accounting(stdout: &str) -> SchedulerStatus {
    let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return SchedulerStatus::Unknown;
    };

    let (state, exit) = line.split_once('|').unwrap_or((line, ""));
    // "CANCELLED by 1000" carries the requesting uid.
    let state = state.split_whitespace().next().unwrap_or_default();
    let (code, signal) = parse_exit_code(exit);

    match state {
        "COMPLETED" => SchedulerStatus::Completed {
            exit_code: code.unwrap_or(0),
        },
        "CANCELLED" => SchedulerStatus::Cancelled,
        "PENDING" | "REQUEUED" => SchedulerStatus::Pending,
        "RUNNING" | "COMPLETING" | "SUSPENDED" => SchedulerStatus::Running,
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => {
            let mut reason = state.to_string();
            if let Some(signal) = signal.filter(|&s| s != 0) {
                reason.push_str(&format!(" (signal {})", signal));
            }
            SchedulerStatus::Failed {
                exit_code: code,
                reason,
            }
        }
        _ => SchedulerStatus::Unknown,
    }
}

/// Splits Slurm's `<exit code>:<signal>` pair.
fn parse_exit_code(field: &str) -> (Option<i32>, Option<i32>) {
    let mut parts = field.trim().splitn(2, ':');
    let code = parts.next().and_then(|p| p.parse().ok());
    let signal = parts.next().and_then(|p| p.parse().ok());
    (code, signal)
}
