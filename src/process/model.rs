//! Process Declaration Model
//!
//! A process is one unit of work: named input paths, named output paths,
//! scalar arguments and a shell script template. Every logical name becomes
//! an environment variable of the running script.
//!
//! # Example
//!
//! ```
//! use stagerun::process::ProcessSpec;
//!
//! let process = ProcessSpec::builder("align")
//!     .input("reads", "data/reads.fastq")
//!     .output("alignment", "aligned.sam")
//!     .arg("threads", 4)
//!     .script(r#"bowtie2 -p "$threads" -U "$reads" -S "$alignment""#)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(process.name(), "align");
//! assert_eq!(process.outputs().len(), 1);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::validator::{validate_declaration, ValidationError};
use crate::environment::Container;

/// A scalar argument value exposed to the script.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// A validated process declaration.
///
/// Built through [`ProcessSpec::builder`]; once built it is immutable.
/// Declaration order of inputs, outputs and args is preserved.
#[derive(Serialize, Debug, Clone)]
pub struct ProcessSpec {
    name: String,
    inputs: IndexMap<String, PathBuf>,
    outputs: IndexMap<String, PathBuf>,
    args: IndexMap<String, ArgValue>,
    script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<Container>,
}

impl ProcessSpec {
    /// Starts a declaration for a process with the given name.
    pub fn builder(name: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder::new(name)
    }

    /// Process name, used to namespace the staging directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input paths keyed by logical name, in declaration order.
    pub fn inputs(&self) -> &IndexMap<String, PathBuf> {
        &self.inputs
    }

    /// Output paths (relative to the staging directory) keyed by logical name.
    pub fn outputs(&self) -> &IndexMap<String, PathBuf> {
        &self.outputs
    }

    /// Scalar arguments keyed by logical name.
    pub fn args(&self) -> &IndexMap<String, ArgValue> {
        &self.args
    }

    /// The unrendered script template.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Isolated execution environment, if any.
    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    /// Returns true if `key` was declared as an output.
    pub fn declares_output(&self, key: &str) -> bool {
        self.outputs.contains_key(key)
    }

    /// Returns a copy of this process running inside `container`.
    pub fn with_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }
}

/// Collects a process declaration and validates it on [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ProcessBuilder {
    pub(crate) name: String,
    pub(crate) inputs: Vec<(String, PathBuf)>,
    pub(crate) outputs: Vec<(String, PathBuf)>,
    pub(crate) args: Vec<(String, ArgValue)>,
    pub(crate) script: String,
    pub(crate) container: Option<Container>,
}

impl ProcessBuilder {
    /// Creates an empty declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            ..Self::default()
        }
    }

    /// Declares an input path. Directories are staged recursively.
    pub fn input(mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.inputs.push((key.into(), path.as_ref().to_path_buf()));
        self
    }

    /// Declares an output path relative to the staging directory.
    pub fn output(mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.outputs.push((key.into(), path.as_ref().to_path_buf()));
        self
    }

    /// Declares a scalar argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    /// Sets the script template.
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Runs the script inside a container or conda environment.
    pub fn container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    /// Returns every problem with the declaration, in the order found.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_declaration(self)
    }

    /// Validates the declaration and freezes it.
    ///
    /// Fails with the first [`ValidationError`] found.
    pub fn build(self) -> Result<ProcessSpec, ValidationError> {
        if let Some(error) = validate_declaration(&self).into_iter().next() {
            return Err(error);
        }

        Ok(ProcessSpec {
            name: self.name,
            inputs: self.inputs.into_iter().collect(),
            outputs: self.outputs.into_iter().collect(),
            args: self.args.into_iter().collect(),
            script: self.script,
            container: self.container,
        })
    }
}
