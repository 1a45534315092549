//! Monitoring Module
//!
//! Per-execution observability that does not depend on the caller's logger.
//!
//! # Components
//!
//! - [`ExecutionLog`]: timestamped lifecycle events written into the staging directory
//! - [`ResourceMonitor`]: CPU and memory sampling of a local child process

pub mod log;
pub mod resource;

pub use self::log::{ExecutionLog, LogEntry, LogEvent};
pub use resource::{ResourceMonitor, ResourceSample, ResourceUsage};
