//! Tool error types.
//!
//! Every tool and transport failure surfaces as a [`ToolError`]. The gateway
//! never returns these to the agent directly; it folds them into a failed
//! [`ToolResult`](crate::ToolResult) using [`ToolError::kind`].

use crate::types::ToolErrorKind;

/// Unified error type for local tools and MCP connections.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    // -- Invocation ----------------------------------------------------------
    /// No local tool or MCP tool is registered under this name.
    #[error("tool not found: `{tool_name}`")]
    NotFound { tool_name: String },

    /// The arguments do not satisfy the tool's schema.
    #[error("invalid arguments for tool `{tool_name}`: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    /// The tool ran and failed.
    #[error("execution failed for tool `{tool_name}`: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    /// The call did not finish within its time limit.
    #[error("tool `{tool_name}` timed out after {millis}ms")]
    Timeout { tool_name: String, millis: u128 },

    // -- MCP -----------------------------------------------------------------
    /// A server could not be launched or failed its handshake.
    #[error("mcp connection to `{server}` failed: {reason}")]
    Connection { server: String, reason: String },

    /// The configured launcher is not on the command allow-list.
    #[error("mcp server `{server}` uses disallowed command `{command}`")]
    CommandNotAllowed { server: String, command: String },

    /// Reading from or writing to the transport failed.
    #[error("mcp transport error on `{server}`: {reason}")]
    Transport { server: String, reason: String },

    /// The server answered with a JSON-RPC error or a malformed payload.
    #[error("mcp protocol error on `{server}`: {reason}")]
    Protocol { server: String, reason: String },

    // -- Upstream ------------------------------------------------------------
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    /// Classify the error for a failed tool result.
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::NotFound { .. } => ToolErrorKind::NotFound,
            Self::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
            Self::Timeout { .. } => ToolErrorKind::Timeout,
            Self::Connection { .. }
            | Self::CommandNotAllowed { .. }
            | Self::Transport { .. }
            | Self::Io(_) => ToolErrorKind::Transport,
            Self::ExecutionFailed { .. } | Self::Protocol { .. } | Self::Json(_) => {
                ToolErrorKind::Execution
            }
        }
    }
}

/// Convenience alias used throughout the tools crate.
pub type Result<T> = std::result::Result<T, ToolError>;
