//! Script Rendering
//!
//! Binds a process's declared inputs, outputs and args into the runtime
//! environment of its script. Rendering is a pure function of the process
//! and its staging directory; writing the result to disk is a separate step.
//!
//! # Environment
//!
//! | Declaration | Variable value                                  |
//! |-------------|-------------------------------------------------|
//! | input       | absolute path of the staged entry               |
//! | output      | absolute path inside the staging directory      |
//! | arg         | literal value                                   |
//!
//! Unresolved references are left to the shell: the default header enables
//! `set -u`, so they fail when the script runs, not here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;

use crate::error::RenderError;
use crate::process::ProcessSpec;
use crate::staging::{StagingDirectory, SCRIPT_FILE};

/// Prepended to scripts that carry no shebang of their own.
pub const SCRIPT_HEADER: &str = "#!/bin/bash\nset -euo pipefail\n";

/// A script body with the environment it must run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScript {
    /// Complete script text, including the shebang line
    pub body: String,
    /// Variables in declaration order: inputs, outputs, args
    pub env: IndexMap<String, String>,
}

impl RenderedScript {
    /// Variable names, in export order.
    pub fn env_keys(&self) -> impl Iterator<Item = &str> {
        self.env.keys().map(|k| k.as_str())
    }

    /// `export KEY='value'` lines for use in a launcher script.
    pub fn exports(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("export {}={}\n", key, shell_quote(value)))
            .collect()
    }

    /// Command running the script at `path`.
    ///
    /// Scripts with the default header go through `bash`; a script declaring
    /// its own interpreter is executed directly so its shebang takes effect.
    pub fn command(&self, path: &Path) -> Vec<String> {
        let path = path.display().to_string();
        if self.body.starts_with(SCRIPT_HEADER) {
            vec!["bash".to_string(), path]
        } else {
            vec![path]
        }
    }

    /// Writes the body to `.stagerun.sh` inside `dir` and makes it executable.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(SCRIPT_FILE);
        fs::write(&path, &self.body)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        debug!("Wrote script {}", path.display());
        Ok(path)
    }
}

/// Stateless renderer; see [`render`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptRenderer;

impl ScriptRenderer {
    /// Renders `process` against its staging directory.
    pub fn render(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
    ) -> Result<RenderedScript, RenderError> {
        render(process, staging)
    }
}

/// Renders `process` against its staging directory.
pub fn render(
    process: &ProcessSpec,
    staging: &StagingDirectory,
) -> Result<RenderedScript, RenderError> {
    let body = render_body(process.name(), process.script())?;

    let mut env = IndexMap::with_capacity(
        process.inputs().len() + process.outputs().len() + process.args().len(),
    );

    for key in process.inputs().keys() {
        let staged = staging
            .staged_input(key)
            .ok_or_else(|| RenderError::UnstagedInput {
                process: process.name().to_string(),
                key: key.clone(),
            })?;
        env.insert(key.clone(), staged.display().to_string());
    }

    for (key, relative) in process.outputs() {
        let path = staging.path().join(relative);
        env.insert(key.clone(), path.display().to_string());
    }

    for (key, value) in process.args() {
        env.insert(key.clone(), value.to_string());
    }

    Ok(RenderedScript { body, env })
}

/// Checks the template's structure and produces the final script text.
fn render_body(process: &str, template: &str) -> Result<String, RenderError> {
    if let Some(offset) = template.find('\0') {
        return Err(RenderError::NulByte {
            process: process.to_string(),
            offset,
        });
    }

    let script = dedent(template);
    if script.trim().is_empty() {
        return Err(RenderError::EmptyScript {
            process: process.to_string(),
        });
    }

    if let Some(interpreter) = script.lines().next().and_then(|l| l.strip_prefix("#!")) {
        if interpreter.trim().is_empty() {
            return Err(RenderError::MissingInterpreter {
                process: process.to_string(),
            });
        }
    }

    let mut body = String::with_capacity(script.len() + SCRIPT_HEADER.len() + 1);
    if !script.starts_with("#!") {
        body.push_str(SCRIPT_HEADER);
    }
    body.push_str(&script);
    body.push('\n');
    Ok(body)
}

/// Removes common leading whitespace and surrounding blank lines.
pub fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    let (Some(start), Some(end)) = (start, end) else {
        return String::new();
    };

    lines[start..=end]
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                &line[indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-quotes `value` for safe interpolation into a shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{StagingManager, StagingMode};
    use tempfile::tempdir;

    fn staged(template: &str) -> (tempfile::TempDir, ProcessSpec, StagingDirectory) {
        let work = tempdir().unwrap();
        let input = work.path().join("reads.fq");
        fs::write(&input, "@r1").unwrap();

        let process = ProcessSpec::builder("render")
            .input("reads", &input)
            .output("sam", "out/aligned.sam")
            .arg("threads", 8)
            .arg("mode", "very fast")
            .script(template)
            .build()
            .unwrap();

        let staging = StagingManager::new(work.path().join("stage"))
            .stage(&process, StagingMode::Copy)
            .unwrap();
        (work, process, staging)
    }

    #[test]
    fn test_dedent() {
        let text = "\n    echo a\n      echo b\n\n    echo c\n  ";
        assert_eq!(dedent(text), "echo a\n  echo b\n\necho c");
        assert_eq!(dedent("   \n  "), "");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_env_binds_staged_paths() {
        let (_work, process, staging) = staged("cp \"$reads\" \"$sam\"");
        let script = render(&process, &staging).unwrap();

        let keys: Vec<&str> = script.env_keys().collect();
        assert_eq!(keys, vec!["reads", "sam", "threads", "mode"]);

        assert_eq!(
            script.env["reads"],
            staging.staged_input("reads").unwrap().display().to_string()
        );
        assert_eq!(
            PathBuf::from(&script.env["sam"]),
            staging.path().join("out/aligned.sam")
        );
        assert_eq!(script.env["threads"], "8");
        assert_eq!(script.env["mode"], "very fast");
    }

    #[test]
    fn test_header_prepended() {
        let (_work, process, staging) = staged("   echo hi");
        let script = render(&process, &staging).unwrap();
        assert_eq!(script.body, format!("{}echo hi\n", SCRIPT_HEADER));
    }

    #[test]
    fn test_existing_shebang_kept() {
        let (_work, process, staging) = staged("#!/usr/bin/env sh\necho hi");
        let script = render(&process, &staging).unwrap();
        assert!(script.body.starts_with("#!/usr/bin/env sh\n"));
        assert!(!script.body.contains("pipefail"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let (_work, process, staging) = staged("echo $reads");
        assert_eq!(
            render(&process, &staging).unwrap(),
            ScriptRenderer.render(&process, &staging).unwrap()
        );
    }

    #[test]
    fn test_render_has_no_side_effects() {
        let (_work, process, staging) = staged("echo $reads");
        render(&process, &staging).unwrap();
        assert!(!staging.file(SCRIPT_FILE).exists());
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            render_body("p", "  \n "),
            Err(RenderError::EmptyScript { .. })
        ));
        assert!(matches!(
            render_body("p", "echo a\0b"),
            Err(RenderError::NulByte { offset: 6, .. })
        ));
        assert!(matches!(
            render_body("p", "#!\necho b"),
            Err(RenderError::MissingInterpreter { .. })
        ));
    }

    #[test]
    fn test_heredoc_shebang_is_script_text() {
        let template = "cat > helper.py <<'PY'\n#!/usr/bin/env python3\nprint('x')\nPY";
        let body = render_body("heredoc", template).unwrap();
        assert_eq!(body, format!("{}{}\n", SCRIPT_HEADER, template));
    }

    #[test]
    fn test_command_follows_shebang() {
        let path = Path::new("/w/.stagerun.sh");
        let (_work, process, staging) = staged("echo hi");
        let script = render(&process, &staging).unwrap();
        assert_eq!(script.command(path), vec!["bash", "/w/.stagerun.sh"]);

        let (_work, process, staging) = staged("#!/usr/bin/env python3\nprint('hi')");
        let script = render(&process, &staging).unwrap();
        assert_eq!(script.command(path), vec!["/w/.stagerun.sh"]);
    }

    #[test]
    fn test_unresolved_reference_is_not_a_render_error() {
        assert!(render_body("p", "echo $undeclared").is_ok());
    }

    #[test]
    fn test_unstaged_input() {
        let (work, _process, staging) = staged("true");
        let other = ProcessSpec::builder("other")
            .input("missing", work.path().join("reads.fq"))
            .script("true")
            .build()
            .unwrap();

        assert!(matches!(
            render(&other, &staging),
            Err(RenderError::UnstagedInput { ref key, .. }) if key == "missing"
        ));
    }

    #[test]
    fn test_exports() {
        let script = RenderedScript {
            body: String::new(),
            env: [("a".to_string(), "x y".to_string())].into_iter().collect(),
        };
        assert_eq!(script.exports(), "export a='x y'\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_to_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let (_work, process, staging) = staged("echo hi");
        let script = render(&process, &staging).unwrap();
        let path = script.write_to(staging.path()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_to_string(path).unwrap(), script.body);
    }
}
