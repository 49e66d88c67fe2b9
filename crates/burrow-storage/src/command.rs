//! Subprocess execution for the zfs/zpool user tools.
//!
//! Arguments are always passed as a literal vector; nothing here goes
//! through a shell.

use crate::error::{Result, StorageError};
use std::process::Output;
use tracing::debug;

/// Captured output from a finished subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // A missing code means the process died to a signal.
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Run a command to completion, treating a non-zero exit as an error
/// carrying the command line and trimmed stderr.
pub async fn exec(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = exec_unchecked(program, args).await?;
    if output.success() {
        return Ok(output);
    }
    Err(StorageError::command_failed(
        render(program, args),
        output.exit_code,
        output.stderr.trim(),
    ))
}

/// Run a command to completion and hand back whatever it produced,
/// leaving exit-status policy to the caller.
pub async fn exec_unchecked(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let rendered = render(program, args);
    debug!(command = %rendered, "running subprocess");

    let raw = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| StorageError::io(format!("failed to spawn {}", rendered), e))?;

    let output = CommandOutput::from(raw);
    debug!(command = %rendered, exit_code = output.exit_code, "subprocess finished");
    Ok(output)
}
