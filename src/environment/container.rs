//! Isolated Execution Environments
//!
//! Wraps the command that runs a rendered script so it executes either on the
//! host or inside a container runtime / conda environment.
//!
//! # Runtime Resolution
//!
//! The micromamba binary used for conda environments is resolved once:
//! 1. `STAGERUN_MICROMAMBA` environment variable
//! 2. `micromamba` found on the system PATH
//! 3. Bare `micromamba`, left to the OS to resolve at spawn time
//!
//! Image and environment acquisition is not handled here; the referenced
//! image or environment must already be available to the runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Lazily-resolved path to the micromamba binary.
pub static MICROMAMBA_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var("STAGERUN_MICROMAMBA") {
        if !path.trim().is_empty() {
            info!("Using micromamba from STAGERUN_MICROMAMBA: {}", path);
            return PathBuf::from(path);
        }
    }

    if let Ok(output) = Command::new("which").arg("micromamba").output() {
        if output.status.success() {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                info!("Using system micromamba: {}", path_str);
                return PathBuf::from(path_str);
            }
        }
    }

    warn!("Micromamba binary not found; conda processes will rely on PATH at spawn time");
    PathBuf::from("micromamba")
});

/// Reference to an isolated execution environment.
///
/// Serialized externally tagged, e.g. `{"docker": "ubuntu:22.04"}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    /// Docker image reference
    Docker(String),
    /// Podman image reference
    Podman(String),
    /// Apptainer/Singularity image path or URI
    Apptainer(String),
    /// Named conda environment run through micromamba
    Conda(String),
}

impl Container {
    /// Name of the runtime handling this environment.
    pub fn runtime(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Podman(_) => "podman",
            Self::Apptainer(_) => "apptainer",
            Self::Conda(_) => "conda",
        }
    }

    /// Image or environment reference.
    pub fn reference(&self) -> &str {
        match self {
            Self::Docker(r) | Self::Podman(r) | Self::Apptainer(r) | Self::Conda(r) => r,
        }
    }

    /// Returns true if the runtime only sees the bind-mounted staging directory.
    ///
    /// Conda environments share the host filesystem and do not need this.
    pub fn is_isolated_filesystem(&self) -> bool {
        !matches!(self, Self::Conda(_))
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.runtime(), self.reference())
    }
}

/// Wraps `command` so it runs in `container` with `workdir` as working
/// directory; without a container the command is returned unchanged.
///
/// The staging directory is bind-mounted at its own absolute path so that
/// rendered paths resolve identically inside and outside a container.
/// `env_keys` are forwarded into docker/podman containers, which do not
/// inherit the caller's environment.
pub fn launch_argv<'a, I>(
    container: Option<&Container>,
    command: Vec<String>,
    workdir: &Path,
    env_keys: I,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let Some(container) = container else {
        return command;
    };
    let workdir = workdir.display().to_string();

    let mut argv = Vec::new();
    match container {
        Container::Docker(image) | Container::Podman(image) => {
            argv.push(container.runtime().to_string());
            argv.extend(["run", "--rm", "-v"].map(String::from));
            argv.push(format!("{}:{}", workdir, workdir));
            argv.push("-w".to_string());
            argv.push(workdir);
            for key in env_keys {
                argv.push("-e".to_string());
                argv.push(key.to_string());
            }
            argv.push(image.clone());
        }
        Container::Apptainer(image) => {
            argv.extend(["apptainer", "exec", "--bind"].map(String::from));
            argv.push(format!("{}:{}", workdir, workdir));
            argv.push("--pwd".to_string());
            argv.push(workdir);
            argv.push(image.clone());
        }
        Container::Conda(env_name) => {
            argv.push(MICROMAMBA_PATH.display().to_string());
            argv.extend(["run", "-n"].map(String::from));
            argv.push(env_name.clone());
        }
    }
    argv.extend(command);
    argv
}
