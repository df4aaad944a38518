//! Multi-agent runtime for moco.
//!
//! Sessions are owned by the [`Orchestrator`], which routes each user turn
//! to an agent and runs it on an [`AgentRuntime`]. The runtime drives the
//! model/tool loop: it streams a model turn, checks every proposed tool call
//! against the guardrails and the loop detector, executes the calls through
//! the tool gateway, and delegates to other agents on request.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   turn   ┌──────────────┐  stream  ┌──────────────┐
//! │ Orchestrator │────────>│ AgentRuntime │────────>│ ModelBackend │
//! │  (sessions)  │         │ (state loop) │         └──────────────┘
//! └──────┬───────┘         └──┬────┬───┬──┘
//!        │                    │    │   │ delegate_to_agent
//!   checkpoints          guard-  tool  └──────> child AgentRuntime
//!   (moco-store)         rails  gateway           (depth + 1)
//!                               (moco-tools)
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`] -- Sessions, routing, checkpoints, event streams.
//! - [`runtime`] -- The per-agent state machine and delegation.
//! - [`llm`] -- Conversation types and the [`ModelBackend`] trait.
//! - [`guardrails`] -- Input, output and tool-call validation.
//! - [`compressor`] -- Context summarization under a token budget.
//! - [`loop_detector`] -- Repeated tool-call detection.
//! - [`agents`] -- Agent definitions and the registry.
//! - [`delegation`] -- The explicit delegation stack.
//! - [`approval`] -- Human approval of selected tools.
//! - [`cancellation`] -- Per-session cancellation tokens.
//! - [`events`] -- The turn event stream.
//! - [`memory`] -- Long-term memory recall hook.
//! - [`config`] -- `moco.toml` loading.
//! - [`error`] -- Agent error types.

pub mod agents;
pub mod approval;
pub mod cancellation;
pub mod compressor;
pub mod config;
pub mod delegation;
pub mod error;
pub mod events;
pub mod guardrails;
pub mod llm;
pub mod loop_detector;
pub mod memory;
pub mod orchestrator;
pub mod runtime;

pub use agents::{
    AgentDefinition, AgentMode, AgentRegistry, DELEGATE_TOOL_NAME, ORCHESTRATOR_AGENT,
};
pub use approval::{ApprovalBroker, ApprovalConfig, ApprovalRequest};
pub use cancellation::CancelRegistry;
pub use compressor::{CharEstimator, CompressionConfig, ContextCompressor, TokenEstimator};
pub use config::{CONFIG_FILE_NAME, MocoConfig, RuntimeConfig};
pub use delegation::{DelegationFrame, DelegationStack};
pub use error::{AgentError, Result};
pub use events::{Event, EventSink, ProgressKind, ProgressStatus};
pub use guardrails::{
    GuardrailAction, GuardrailConfig, GuardrailPipeline, GuardrailResult, TextValidator,
    ToolValidator,
};
pub use llm::{Message, ModelBackend, ModelChunk, ModelRequest, ModelStream, ModelTurn, Role, ToolCall};
pub use loop_detector::{LoopDetectionConfig, LoopDetector};
pub use memory::{MemoryStore, RecallHit};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, Session, SessionInfo};
pub use runtime::{AgentRuntime, RunOutcome, RuntimeServices, RuntimeState, TurnContext};
