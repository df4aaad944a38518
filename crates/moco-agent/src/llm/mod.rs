//! Model-facing types and the [`ModelBackend`] capability.
//!
//! - [`types`] -- Messages, tool calls, and the assembled [`ModelTurn`].
//! - [`backend`] -- The streaming backend trait the runtime consumes.

pub mod backend;
pub mod types;

pub use backend::{ModelBackend, ModelChunk, ModelRequest, ModelStream};
pub use types::{Message, ModelTurn, Role, ToolCall};
