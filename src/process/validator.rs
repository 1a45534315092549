//! Process Declaration Validation
//!
//! Checks the structural completeness of a declaration before it is frozen:
//! - Non-empty process name
//! - Keys that are usable as shell variable names
//! - Key uniqueness across inputs, outputs and args
//! - Output paths that stay inside the staging directory

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use log::debug;
use thiserror::Error;

use super::model::ProcessBuilder;

/// Variables the script runtime relies on; a declaration may not shadow them.
const RESERVED_KEYS: &[&str] = &["PATH", "HOME", "PWD", "SHELL", "USER", "IFS"];

/// Which part of a declaration a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Input,
    Output,
    Arg,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Arg => write!(f, "arg"),
        }
    }
}

/// A structural defect in a process declaration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("process has an empty or whitespace-only name")]
    EmptyName,

    #[error("process '{process}' declares an {kind} with an empty key")]
    EmptyKey { process: String, kind: KeyKind },

    #[error("process '{process}': {kind} key '{key}' is not a valid shell variable name")]
    InvalidKey {
        process: String,
        kind: KeyKind,
        key: String,
    },

    #[error("process '{process}': {kind} key '{key}' shadows a reserved variable")]
    ReservedKey {
        process: String,
        kind: KeyKind,
        key: String,
    },

    #[error("process '{process}': key '{key}' is declared more than once")]
    DuplicateKey { process: String, key: String },

    #[error("process '{process}': output '{key}' has an empty path")]
    EmptyOutputPath { process: String, key: String },

    #[error("process '{process}': output '{key}' must name a path inside the staging directory, got {}", .path.display())]
    EscapingOutput {
        process: String,
        key: String,
        path: PathBuf,
    },
}

/// Returns true if `key` can be exported as a shell variable.
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true if `path` is relative, never climbs above its base and names
/// something below it rather than the base itself.
fn stays_inside(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        && path
            .components()
            .any(|component| matches!(component, Component::Normal(_)))
}

/// Validates a whole declaration, returning all problems found.
pub(crate) fn validate_declaration(builder: &ProcessBuilder) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if builder.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
        return errors;
    }
    let process = builder.name.as_str();

    let keys = builder
        .inputs
        .iter()
        .map(|(k, _)| (k, KeyKind::Input))
        .chain(builder.outputs.iter().map(|(k, _)| (k, KeyKind::Output)))
        .chain(builder.args.iter().map(|(k, _)| (k, KeyKind::Arg)));

    let mut seen = HashSet::new();
    for (key, kind) in keys {
        if key.is_empty() {
            errors.push(ValidationError::EmptyKey {
                process: process.to_string(),
                kind,
            });
            continue;
        }
        if !is_valid_key(key) {
            errors.push(ValidationError::InvalidKey {
                process: process.to_string(),
                kind,
                key: key.clone(),
            });
        } else if RESERVED_KEYS.contains(&key.as_str()) {
            errors.push(ValidationError::ReservedKey {
                process: process.to_string(),
                kind,
                key: key.clone(),
            });
        }
        if !seen.insert(key.as_str()) {
            errors.push(ValidationError::DuplicateKey {
                process: process.to_string(),
                key: key.clone(),
            });
        }
    }

    for (key, path) in &builder.outputs {
        if path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyOutputPath {
                process: process.to_string(),
                key: key.clone(),
            });
        } else if !stays_inside(path) {
            errors.push(ValidationError::EscapingOutput {
                process: process.to_string(),
                key: key.clone(),
                path: path.clone(),
            });
        }
    }

    if errors.is_empty() {
        debug!(
            "Process '{}' declaration valid: {} inputs, {} outputs, {} args",
            process,
            builder.inputs.len(),
            builder.outputs.len(),
            builder.args.len()
        );
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSpec;

    #[test]
    fn test_valid_keys() {
        assert!(is_valid_key("reads"));
        assert!(is_valid_key("_hidden"));
        assert!(is_valid_key("sample_2"));
        assert!(!is_valid_key("2sample"));
        assert!(!is_valid_key("my key"));
        assert!(!is_valid_key("a-b"));
        assert!(!is_valid_key(""));
    }

    #[test]
    fn test_empty_name() {
        let errors = ProcessSpec::builder("   ").validate();
        assert_eq!(errors, vec![ValidationError::EmptyName]);
    }

    #[test]
    fn test_empty_key() {
        let result = ProcessSpec::builder("p").input("", "a.txt").build();
        assert!(matches!(
            result,
            Err(ValidationError::EmptyKey {
                kind: KeyKind::Input,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_key() {
        let result = ProcessSpec::builder("p").arg("max depth", 3).build();
        assert!(matches!(result, Err(ValidationError::InvalidKey { .. })));
    }

    #[test]
    fn test_reserved_key() {
        let result = ProcessSpec::builder("p").arg("PATH", "/tmp").build();
        assert!(matches!(result, Err(ValidationError::ReservedKey { .. })));
    }

    #[test]
    fn test_duplicate_key_across_sections() {
        let errors = ProcessSpec::builder("p")
            .output("result", "r.txt")
            .arg("result", 1)
            .validate();

        assert_eq!(
            errors,
            vec![ValidationError::DuplicateKey {
                process: "p".to_string(),
                key: "result".to_string(),
            }]
        );
    }

    #[test]
    fn test_duplicate_key_within_section() {
        let errors = ProcessSpec::builder("p")
            .input("a", "x.txt")
            .input("a", "y.txt")
            .validate();

        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_output_must_stay_inside() {
        let absolute = ProcessSpec::builder("p").output("o", "/tmp/out.txt").build();
        assert!(matches!(absolute, Err(ValidationError::EscapingOutput { .. })));

        let parent = ProcessSpec::builder("p").output("o", "../out.txt").build();
        assert!(matches!(parent, Err(ValidationError::EscapingOutput { .. })));

        for base in [".", "./.", "./"] {
            let result = ProcessSpec::builder("p").output("o", base).build();
            assert!(
                matches!(result, Err(ValidationError::EscapingOutput { .. })),
                "{base:?} names the staging directory itself"
            );
        }

        let nested = ProcessSpec::builder("p").output("o", "./qc/report.html").build();
        assert!(nested.is_ok());
    }

    #[test]
    fn test_empty_output_path() {
        let result = ProcessSpec::builder("p").output("o", "").build();
        assert!(matches!(result, Err(ValidationError::EmptyOutputPath { .. })));
    }

    #[test]
    fn test_collects_all_errors() {
        let errors = ProcessSpec::builder("p")
            .input("bad key", "a.txt")
            .output("o", "../escape")
            .arg("HOME", "x")
            .validate();

        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::DuplicateKey {
            process: "align".to_string(),
            key: "reads".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "process 'align': key 'reads' is declared more than once"
        );
    }
}
