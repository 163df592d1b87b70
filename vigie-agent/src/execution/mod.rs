//! External tool execution for collectors
//!
//! Collectors shell out to system tools (`ip neigh`, ...). Every invocation is
//! bounded by a timeout; a timed-out tool is killed, never left behind.

use anyhow::{Context, Result};
use serde::Serialize;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Tool execution result
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ToolOutput {
    /// Fails with the tool's stderr when it did not exit cleanly
    pub fn ensure_success(self, program: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        anyhow::bail!(
            "{} exited with code {:?}: {}",
            program,
            self.exit_code,
            self.stderr.trim()
        )
    }
}

/// Runs `program args...` directly (no shell) with a timeout
pub async fn run_tool<I, S>(program: &str, args: I, timeout: Duration) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start_time = Instant::now();
    debug!("Executing tool: {} (timeout: {:?})", program, timeout);

    let output = tokio::time::timeout(
        timeout,
        AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("{program} timed out after {timeout:?}"))?
    .with_context(|| format!("Failed to execute {program}"))?;

    Ok(ToolOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        execution_time_ms: start_time.elapsed().as_millis(),
    })
}
