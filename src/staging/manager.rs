//! Input Staging
//!
//! Creates a [`StagingDirectory`] for a process and materializes every
//! declared input into it, either as a byte-for-byte copy or as a link to
//! the original.
//!
//! A failed staging never leaves a half-populated directory behind: the
//! partially built tree is removed before the error is returned.

use std::env;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::directory::{StagedInput, StagingDirectory, INPUTS_DIR};
use crate::error::{ConfigError, StagingError};
use crate::process::ProcessSpec;

/// Environment variable overriding the staging root.
pub const WORKDIR_ENV: &str = "STAGERUN_WORKDIR";

/// Staging root used when `STAGERUN_WORKDIR` is unset, relative to the
/// current directory.
pub const DEFAULT_STAGING_ROOT: &str = "stagerun_work";

/// Policy governing how inputs are materialized.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StagingMode {
    /// Duplicate every input; the staging directory is self-contained.
    Copy,
    /// Link to the originals; they must stay unchanged and reachable for
    /// the lifetime of the execution.
    #[default]
    InPlace,
}

impl fmt::Display for StagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::InPlace => write!(f, "in-place"),
        }
    }
}

impl FromStr for StagingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "in-place" | "inplace" | "in_place" | "symlink" | "link" => Ok(Self::InPlace),
            other => Err(ConfigError::InvalidStagingMode(other.to_string())),
        }
    }
}

/// Allocates and populates staging directories under a common root.
#[derive(Debug, Clone)]
pub struct StagingManager {
    root: PathBuf,
}

impl StagingManager {
    /// Creates a manager staging under `root`. The root is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a manager rooted at `STAGERUN_WORKDIR`, or at
    /// `./stagerun_work` when the variable is unset.
    pub fn from_env() -> Self {
        Self::new(root_from(env::var(WORKDIR_ENV).ok()))
    }

    /// Root under which staging directories are allocated.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stages every input of `process` into a fresh directory.
    ///
    /// All inputs are checked before anything is created, so a missing
    /// input never allocates a directory at all.
    pub fn stage(
        &self,
        process: &ProcessSpec,
        mode: StagingMode,
    ) -> Result<StagingDirectory, StagingError> {
        for (key, source) in process.inputs() {
            check_input(key, source)?;
        }

        let mut staging = StagingDirectory::allocate(&self.root, process.name(), mode)?;

        match populate(&mut staging, process, mode) {
            Ok(()) => {
                info!(
                    "Staged {} inputs for '{}' ({}) at {}",
                    staging.entries().len(),
                    process.name(),
                    mode,
                    staging.path().display()
                );
                Ok(staging)
            }
            Err(e) => {
                if let Err(cleanup_err) = fs::remove_dir_all(staging.path()) {
                    warn!(
                        "Failed to remove partial staging directory {}: {}",
                        staging.path().display(),
                        cleanup_err
                    );
                }
                Err(e)
            }
        }
    }
}

impl Default for StagingManager {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Staging root for a `STAGERUN_WORKDIR` value; blank counts as unset.
fn root_from(workdir: Option<String>) -> PathBuf {
    match workdir {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => env::current_dir()
            .map(|cwd| cwd.join(DEFAULT_STAGING_ROOT))
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STAGING_ROOT)),
    }
}

/// Verifies an input exists and can be read.
fn check_input(key: &str, source: &Path) -> Result<(), StagingError> {
    let unreadable = |e: io::Error| StagingError::UnreadableInput {
        key: key.to_string(),
        path: source.to_path_buf(),
        source: e,
    };

    let metadata = match fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StagingError::MissingInput {
                key: key.to_string(),
                path: source.to_path_buf(),
            })
        }
        Err(e) => return Err(unreadable(e)),
    };

    if metadata.is_dir() {
        fs::read_dir(source).map_err(unreadable)?;
    } else {
        File::open(source).map_err(unreadable)?;
    }
    Ok(())
}

/// Materializes every input of `process` into `staging`.
fn populate(
    staging: &mut StagingDirectory,
    process: &ProcessSpec,
    mode: StagingMode,
) -> Result<(), StagingError> {
    let inputs_root = staging.path().join(INPUTS_DIR);
    fs::create_dir(&inputs_root).map_err(|e| StagingError::CreateDirectory {
        path: inputs_root.clone(),
        source: e,
    })?;

    for (key, source) in process.inputs() {
        let source = source
            .canonicalize()
            .map_err(|e| StagingError::UnreadableInput {
                key: key.clone(),
                path: source.clone(),
                source: e,
            })?;

        // One slot per key, so inputs sharing a file name never collide.
        let slot = inputs_root.join(key);
        let file_name = source
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| key.into());
        let destination = slot.join(file_name);

        let result = fs::create_dir(&slot).and_then(|()| match mode {
            StagingMode::Copy => copy_recursive(&source, &destination),
            StagingMode::InPlace => link(&source, &destination),
        });
        result.map_err(|e| StagingError::Materialize {
            key: key.clone(),
            path: destination.clone(),
            source: e,
        })?;

        debug!(
            "Staged input '{}': {} -> {}",
            key,
            source.display(),
            destination.display()
        );
        staging.insert_entry(
            key,
            StagedInput {
                source,
                staged: destination,
            },
        );
    }

    staging
        .write_manifest(process.name())
        .map_err(|e| StagingError::Manifest {
            path: staging.path().to_path_buf(),
            source: e,
        })?;

    Ok(())
}

/// Copies a file or directory tree byte-for-byte, following links.
fn copy_recursive(source: &Path, destination: &Path) -> io::Result<()> {
    let metadata = fs::metadata(source)?;

    if metadata.is_dir() {
        fs::create_dir(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &destination.join(entry.file_name()))?;
        }
        // Applied last so read-only directories can still be filled.
        fs::set_permissions(destination, metadata.permissions())?;
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

#[cfg(unix)]
fn link(source: &Path, destination: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, destination)
}

#[cfg(windows)]
fn link(source: &Path, destination: &Path) -> io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, destination)
    } else {
        std::os::windows::fs::symlink_file(source, destination)
    }
}
