//! Tool definitions and results shared by the gateway and the agent runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name. MCP tools use `server__tool`.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Keys listed under the schema's `required` array.
    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a tool call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Refused by guardrail policy.
    Blocked,
    /// Refused because the same call repeated too often.
    LoopDetected,
    /// No tool with that name.
    NotFound,
    /// Arguments failed schema validation.
    InvalidArguments,
    Timeout,
    Transport,
    /// The tool ran and reported a failure.
    Execution,
    /// A human declined, or approval timed out.
    Rejected,
    /// Delegation would exceed the depth cap.
    DepthExceeded,
    Cancelled,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::LoopDetected => "loop_detected",
            Self::NotFound => "not_found",
            Self::InvalidArguments => "invalid_arguments",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Execution => "execution",
            Self::Rejected => "rejected",
            Self::DepthExceeded => "depth_exceeded",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The outcome of one tool call, ready to feed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The id of the tool call this answers.
    pub tool_call_id: String,

    pub success: bool,

    /// Output text on success, a human-readable reason on failure.
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    /// A successful result.
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            content: content.into(),
            error_kind: None,
        }
    }

    /// A failed result of the given kind.
    pub fn failure(
        tool_call_id: impl Into<String>,
        kind: ToolErrorKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            content: content.into(),
            error_kind: Some(kind),
        }
    }

    /// Build a failed result from a [`ToolError`](crate::ToolError).
    pub fn from_error(tool_call_id: impl Into<String>, err: &crate::ToolError) -> Self {
        Self::failure(tool_call_id, err.kind(), format!("Error: {err}"))
    }
}
