//! Execution Environment Module
//!
//! Container runtimes and conda environments a process can run inside.

pub mod container;

pub use container::{launch_argv, Container, MICROMAMBA_PATH};
