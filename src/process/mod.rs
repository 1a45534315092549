//! Process Declaration Module
//!
//! Provides the immutable process declaration consumed by the executors.
//!
//! # Structure
//!
//! - [`model`]: `ProcessSpec`, its builder and argument values
//! - [`validator`]: Structural checks applied when a declaration is built

pub mod model;
pub mod validator;

pub use model::{ArgValue, ProcessBuilder, ProcessSpec};
pub use validator::{KeyKind, ValidationError};
