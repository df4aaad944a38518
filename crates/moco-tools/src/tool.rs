//! The local tool trait and argument/output helpers.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, ToolError};
use crate::types::ToolDefinition;

/// Tool output longer than this is cut down to a preview.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 50_000;

/// How much of an oversized output is kept.
const PREVIEW_CHARS: usize = 500;

/// A tool implemented in-process.
///
/// The gateway validates arguments against [`Tool::definition`] before
/// calling [`Tool::execute`], so implementations may assume required keys
/// are present.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Run the tool and return text for the model.
    async fn execute(&self, arguments: Value) -> Result<String>;
}

/// Check that `arguments` is an object carrying every required key.
pub fn validate_arguments(definition: &ToolDefinition, arguments: &Value) -> Result<()> {
    let Some(object) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments {
            tool_name: definition.name.clone(),
            reason: "arguments must be a JSON object".into(),
        });
    };

    let missing: Vec<&str> = definition
        .required_keys()
        .filter(|key| object.get(*key).is_none_or(Value::is_null))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool_name: definition.name.clone(),
            reason: format!("missing required arguments: {}", missing.join(", ")),
        })
    }
}

/// Replace an oversized output with a preview and a size notice.
pub fn truncate_tool_output(output: String, tool_name: &str) -> String {
    let total_chars = output.chars().count();
    if total_chars <= MAX_TOOL_OUTPUT_CHARS {
        return output;
    }

    let total_lines = output.lines().count();
    let preview: String = output.chars().take(PREVIEW_CHARS).collect();
    tracing::debug!(tool = tool_name, total_chars, "tool output truncated");

    format!(
        "{preview}\n\n[OUTPUT TRUNCATED] `{tool_name}` produced {total_chars} chars in \
         {total_lines} lines; only the first {PREVIEW_CHARS} chars are shown. \
         Narrow the request to see more."
    )
}
