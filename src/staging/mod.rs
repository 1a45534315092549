//! Staging Module
//!
//! Per-execution working directories and input materialization.

pub mod directory;
pub mod manager;

pub use directory::{
    StagedInput, StagingDirectory, INPUTS_DIR, LAUNCHER_FILE, LOG_FILE, MANIFEST_FILE,
    SCRIPT_FILE, STDERR_FILE, STDOUT_FILE,
};
pub use manager::{StagingManager, StagingMode, DEFAULT_STAGING_ROOT, WORKDIR_ENV};
