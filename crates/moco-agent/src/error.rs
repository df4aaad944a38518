//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`]. Only a few
//! variants ever end a turn (`LoopDetected`, `BackendTransport`,
//! `MaxIterations`, `Cancelled`); guardrail and tool failures are folded
//! into the conversation instead of being returned.

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Policy --------------------------------------------------------------
    /// A guardrail refused the input, output or tool call.
    #[error("blocked by guardrail: {reason}")]
    ValidationBlocked { reason: String },

    /// A tool call repeated too often within the detection window.
    #[error("loop detected: `{tool_name}` repeated {count} times with the same arguments")]
    LoopDetected { tool_name: String, count: usize },

    /// A delegation would exceed the configured depth cap.
    #[error("delegation depth {depth} exceeds the limit of {max_depth}")]
    DelegationDepthExceeded { depth: u32, max_depth: u32 },

    // -- Execution -----------------------------------------------------------
    /// A tool failed. Normally absorbed into the conversation.
    #[error("tool `{tool_name}` failed: {reason}")]
    ToolFailure { tool_name: String, reason: String },

    /// The model backend could not be reached, even after a retry.
    #[error("model backend error: {reason}")]
    BackendTransport { reason: String },

    /// The agent kept calling tools until the iteration limit.
    #[error("agent `{agent}` reached the limit of {max_iterations} iterations")]
    MaxIterations { agent: String, max_iterations: u32 },

    /// The turn was cancelled. A normal terminal state, not a fault.
    #[error("cancelled")]
    Cancelled,

    // -- Lookup --------------------------------------------------------------
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("agent not found: {agent}")]
    AgentNotFound { agent: String },

    #[error("checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    /// An MCP server could not be reached.
    #[error("connection error: {reason}")]
    Connection { reason: String },

    // -- Configuration -------------------------------------------------------
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] moco_store::StoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Map a store `NotFound` on a checkpoint to [`AgentError::CheckpointNotFound`].
    pub(crate) fn from_checkpoint_lookup(err: moco_store::StoreError, checkpoint_id: &str) -> Self {
        match err {
            moco_store::StoreError::NotFound { .. } => Self::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_owned(),
            },
            other => Self::Store(other),
        }
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;
