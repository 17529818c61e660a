//! Blocking external command execution with captured output.
//!
//! Provisioning steps (network setup, image customization, hypervisor
//! launch) are shell scripts whose combined stdout/stderr is kept for
//! operator diagnosis when they fail.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::{Result, VmError};
use duct::cmd;
use tracing::debug;

/// Exit status and interleaved stdout/stderr of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last `max_lines` lines of output, for error messages.
    pub fn tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Run `program` with `args` to completion and capture its output.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::success`]. Failing to spawn the process is.
pub fn run_captured<A: AsRef<OsStr>>(
    program: &Path,
    args: &[A],
    working_dir: Option<&Path>,
) -> Result<CommandOutput> {
    let full_command = format!(
        "{} {}",
        program.display(),
        args.iter()
            .map(|a| a.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    debug!("Running: {}", full_command);

    let mut expression = cmd(program, args)
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked();
    if let Some(dir) = working_dir {
        expression = expression.dir(dir);
    }

    let output = expression.run().map_err(|e| {
        VmError::Command(format!("Failed to start command '{}': {}", full_command, e))
    })?;

    Ok(CommandOutput {
        code: output.status.code(),
        output: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captured_collects_stdout_and_stderr() {
        let out = run_captured(
            Path::new("sh"),
            &["-c", "echo out; echo err 1>&2; exit 3"],
            None,
        )
        .expect("sh should start");

        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[test]
    fn test_run_captured_respects_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_captured(Path::new("sh"), &["-c", "pwd -P"], Some(dir.path())).unwrap();

        assert!(out.success());
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(out.output.trim(), canonical.display().to_string());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let result = run_captured(Path::new("/nonexistent/provision.sh"), &["x"], None);
        assert!(matches!(result, Err(VmError::Command(_))));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let out = CommandOutput {
            code: Some(1),
            output: "a\nb\nc\nd".to_string(),
        };
        assert_eq!(out.tail(2), "c\nd");
        assert_eq!(out.tail(10), "a\nb\nc\nd");
    }
}
