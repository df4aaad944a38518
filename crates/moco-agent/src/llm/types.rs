//! Core types for model interaction.
//!
//! These types model the data flowing between the agent runtime and a model
//! backend. They are provider-agnostic; translating them into a vendor wire
//! format is the backend's job.

use moco_tools::{ToolErrorKind, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// A single message in a conversation history.
///
/// Messages are never edited after they are appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content. May be empty for assistant messages that only
    /// carry tool calls.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// The tool call this message answers (only for [`Role::Tool`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Why the tool call failed, for failed tool results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,

    /// Cached token estimate, filled in when the message is appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<usize>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            error_kind: None,
            token_estimate: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying text and tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool message from a tool result.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            error_kind: result.error_kind,
            ..Self::new(Role::Tool, result.content.clone())
        }
    }

    pub fn with_token_estimate(mut self, estimate: usize) -> Self {
        self.token_estimate = Some(estimate);
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model for correlating results.
    pub id: String,

    /// The tool to invoke.
    pub name: String,

    /// Arguments as a JSON object.
    pub arguments: Value,

    /// The agent that proposed the call.
    #[serde(default)]
    pub agent: String,

    /// Delegation depth of the proposing agent (0 for the session's agent).
    #[serde(default)]
    pub depth: u32,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            agent: String::new(),
            depth: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Model turns
// ---------------------------------------------------------------------------

/// One complete model response, assembled from the streamed chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    /// Concatenated text chunks.
    pub text: String,

    /// Reasoning trace, if the backend exposes one.
    pub thinking: String,

    /// Tool calls in the order the model proposed them.
    pub tool_calls: Vec<ToolCall>,

    /// Whether the model marked the tool calls as independent of each other.
    pub parallel: bool,
}

impl ModelTurn {
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}
