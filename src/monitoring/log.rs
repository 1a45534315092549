//! Execution Event Log
//!
//! Records lifecycle events of one execution (staged, started, submitted,
//! finished) with wall-clock timestamps, both in memory and appended to
//! `.stagerun.log` inside the staging directory.
//!
//! Writing the file is best-effort: a failed append is logged and the
//! execution carries on.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::warn;

use crate::staging::LOG_FILE;

/// Kind of lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Inputs materialized
    Staged,
    /// Script written to disk
    Rendered,
    /// Local child spawned
    Started,
    /// Batch job accepted by the scheduler
    Submitted { job_id: String },
    /// Scheduler reported a state change
    StateChanged { state: String },
    /// Script finished and outputs resolved
    Completed,
    /// Any failure after staging
    Failed,
    /// Execution cancelled by the caller or scheduler
    Cancelled,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staged => write!(f, "STAGED"),
            Self::Rendered => write!(f, "RENDERED"),
            Self::Started => write!(f, "STARTED"),
            Self::Submitted { job_id } => write!(f, "SUBMITTED {}", job_id),
            Self::StateChanged { state } => write!(f, "STATE {}", state),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub event: LogEvent,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.event
        )?;
        if !self.message.is_empty() {
            write!(f, " {}", self.message)?;
        }
        Ok(())
    }
}

/// Event log of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
    entries: Vec<LogEntry>,
    start_time: Instant,
}

impl ExecutionLog {
    /// Starts a log writing to `.stagerun.log` under `staging_dir`.
    pub fn open(staging_dir: &Path) -> Self {
        Self {
            path: staging_dir.join(LOG_FILE),
            entries: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event and appends it to the log file.
    pub fn record(&mut self, event: LogEvent, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            event,
            message: message.into(),
        };

        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", entry));
        if let Err(e) = appended {
            warn!("Failed to append to {}: {}", self.path.display(), e);
        }

        self.entries.push(entry);
    }

    /// Returns all recorded events.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time since the log was opened.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_record_appends_lines() {
        let dir = tempdir().unwrap();
        let mut log = ExecutionLog::open(dir.path());

        log.record(LogEvent::Staged, "2 inputs");
        log.record(
            LogEvent::Submitted {
                job_id: "4242".to_string(),
            },
            "",
        );
        log.record(LogEvent::Completed, "exit code 0");

        assert_eq!(log.entries().len(), 3);
        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("[STAGED] 2 inputs"));
        assert!(lines[1].ends_with("[SUBMITTED 4242]"));
        assert!(lines[2].contains("[COMPLETED]"));
    }

    #[test]
    fn test_unwritable_log_is_not_fatal() {
        let dir = tempdir().unwrap();
        let mut log = ExecutionLog::open(&dir.path().join("missing/dir"));

        log.record(LogEvent::Failed, "boom");
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].event, LogEvent::Failed);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(LogEvent::Cancelled.to_string(), "CANCELLED");
        assert_eq!(
            LogEvent::StateChanged {
                state: "RUNNING".to_string()
            }
            .to_string(),
            "STATE RUNNING"
        );
    }

    #[test]
    fn test_elapsed() {
        let dir = tempdir().unwrap();
        let log = ExecutionLog::open(dir.path());
        std::thread::sleep(Duration::from_millis(20));
        assert!(log.elapsed() >= Duration::from_millis(20));
    }
}
