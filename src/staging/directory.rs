//! Staging Directory
//!
//! An isolated, uniquely-named working directory created per execution.
//! It holds the materialized inputs, the rendered script, captured output
//! streams and the event log, and is the working directory of the script.
//!
//! # Layout
//!
//! ```text
//! <root>/<name>-<pid>-<seq>/
//!   inputs/<key>/<file name>   staged inputs
//!   .stagerun.sh               rendered script
//!   .stagerun.launcher         cluster launcher
//!   .stagerun.out/.err         captured streams
//!   .stagerun.log              event log
//!   .stagerun.json             manifest
//! ```
//!
//! Directories are retained after execution; [`StagingDirectory::cleanup`]
//! is the only way they are removed.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use log::{debug, info};
use serde::Serialize;

use super::manager::StagingMode;
use crate::error::StagingError;

/// Subdirectory holding staged inputs.
pub const INPUTS_DIR: &str = "inputs";
/// Rendered script file name.
pub const SCRIPT_FILE: &str = ".stagerun.sh";
/// Cluster launcher file name.
pub const LAUNCHER_FILE: &str = ".stagerun.launcher";
/// Captured standard output.
pub const STDOUT_FILE: &str = ".stagerun.out";
/// Captured standard error.
pub const STDERR_FILE: &str = ".stagerun.err";
/// Event log file name.
pub const LOG_FILE: &str = ".stagerun.log";
/// Manifest file name.
pub const MANIFEST_FILE: &str = ".stagerun.json";

/// Bound on name allocation retries when a candidate already exists.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Process-wide allocation sequence.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One staged input entry.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    /// Canonical path of the original input
    pub source: PathBuf,
    /// Path of the copy or link inside the staging directory
    pub staged: PathBuf,
}

#[derive(Serialize)]
struct Manifest<'a> {
    process: &'a str,
    mode: StagingMode,
    created_at: String,
    inputs: &'a IndexMap<String, StagedInput>,
}

/// An allocated staging directory and its staged inputs.
#[derive(Debug, Clone)]
pub struct StagingDirectory {
    path: PathBuf,
    mode: StagingMode,
    entries: IndexMap<String, StagedInput>,
    created_at: DateTime<Local>,
}

impl StagingDirectory {
    /// Allocates a fresh, empty directory under `root`.
    ///
    /// The final path component is `<name>-<pid>-<seq>`. The directory is
    /// created non-recursively, so an existing directory is never reused:
    /// on collision the next sequence number is tried.
    pub(crate) fn allocate(
        root: &Path,
        name: &str,
        mode: StagingMode,
    ) -> Result<Self, StagingError> {
        fs::create_dir_all(root).map_err(|e| StagingError::CreateDirectory {
            path: root.to_path_buf(),
            source: e,
        })?;
        let root = root
            .canonicalize()
            .map_err(|e| StagingError::CreateDirectory {
                path: root.to_path_buf(),
                source: e,
            })?;

        let stem = sanitize_name(name);
        let pid = std::process::id();

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
            let candidate = root.join(format!("{}-{}-{}", stem, pid, seq));

            match fs::create_dir(&candidate) {
                Ok(()) => {
                    debug!("Allocated staging directory {}", candidate.display());
                    return Ok(Self {
                        path: candidate,
                        mode,
                        entries: IndexMap::new(),
                        created_at: Local::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Staging directory {} exists, retrying", candidate.display());
                }
                Err(e) => {
                    return Err(StagingError::CreateDirectory {
                        path: candidate,
                        source: e,
                    })
                }
            }
        }

        Err(StagingError::Exhausted {
            name: name.to_string(),
            root,
        })
    }

    /// Absolute path of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the inputs were staged with.
    pub fn mode(&self) -> StagingMode {
        self.mode
    }

    /// When the directory was allocated.
    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// Staged path of the input declared under `key`.
    pub fn staged_input(&self, key: &str) -> Option<&Path> {
        self.entries.get(key).map(|entry| entry.staged.as_path())
    }

    /// All staged inputs in declaration order.
    pub fn entries(&self) -> &IndexMap<String, StagedInput> {
        &self.entries
    }

    /// Path of a bookkeeping file inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub(crate) fn insert_entry(&mut self, key: &str, entry: StagedInput) {
        self.entries.insert(key.to_string(), entry);
    }

    /// Writes `.stagerun.json` describing how the inputs were staged.
    pub(crate) fn write_manifest(&self, process: &str) -> io::Result<PathBuf> {
        let manifest_path = self.file(MANIFEST_FILE);
        let manifest = Manifest {
            process,
            mode: self.mode,
            created_at: self.created_at.to_rfc3339(),
            inputs: &self.entries,
        };

        let mut writer = BufWriter::new(File::create(&manifest_path)?);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;
        Ok(manifest_path)
    }

    /// Removes the directory and everything in it.
    ///
    /// Inputs staged in place are links, so their originals are untouched.
    pub fn cleanup(self) -> io::Result<()> {
        fs::remove_dir_all(&self.path)?;
        info!("Removed staging directory {}", self.path.display());
        Ok(())
    }
}

/// Reduces a process name to characters safe in a single path component.
fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.');
    if sanitized.is_empty() {
        "process".to_string()
    } else {
        sanitized.to_string()
    }
}
