//! `execute_bash`: run a shell command with a working directory and timeout.
//!
//! The child is spawned with `kill_on_drop(true)`, so a timed-out or
//! cancelled call never leaves a stray process behind.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Result, ToolError};
use crate::tool::Tool;
use crate::types::ToolDefinition;

pub const SHELL_TOOL_NAME: &str = "execute_bash";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Built-in shell tool.
#[derive(Debug, Clone)]
pub struct ShellTool {
    working_dir: PathBuf,
    default_timeout_secs: u64,
}

impl ShellTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.default_timeout_secs = timeout_secs;
        self
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            SHELL_TOOL_NAME,
            "Execute a shell command and return its exit code, stdout and stderr",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"},
                    "working_dir": {"type": "string", "description": "Working directory (optional)"},
                    "timeout_secs": {"type": "integer", "description": "Timeout in seconds (default: 30)"}
                },
                "required": ["command"]
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<String> {
        let command = arguments
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool_name: SHELL_TOOL_NAME.into(),
                reason: "`command` must be a string".into(),
            })?;

        let working_dir = arguments
            .get("working_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone());

        let timeout_secs = arguments
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs);

        debug!(command, working_dir = %working_dir.display(), timeout_secs, "executing shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: SHELL_TOOL_NAME.into(),
                reason: format!("failed to spawn process: {e}"),
            })?;

        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            warn!(command, timeout_secs, "shell command timed out");
            ToolError::Timeout {
                tool_name: SHELL_TOOL_NAME.into(),
                millis: u128::from(timeout_secs) * 1_000,
            }
        })?
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: SHELL_TOOL_NAME.into(),
            reason: format!("process error: {e}"),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(exit_code, "shell command completed");

        let mut text = format!("exit code: {exit_code}\n");
        if !stdout.is_empty() {
            text.push_str("stdout:\n");
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("stderr:\n");
            text.push_str(&stderr);
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
