//! The model backend capability.
//!
//! A backend turns a request into a stream of [`ModelChunk`]s. The runtime
//! pulls the stream one chunk at a time, so a slow consumer applies
//! backpressure to the backend instead of buffering the whole response.

use async_trait::async_trait;
use futures::stream::BoxStream;
use moco_tools::ToolDefinition;

use crate::error::Result;
use crate::llm::types::{Message, ToolCall};

/// One increment of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// A piece of assistant text.
    Text(String),
    /// A piece of the reasoning trace.
    Thinking(String),
    /// A complete tool call proposal.
    ToolCall(ToolCall),
    /// The tool calls of this response are independent and may run
    /// concurrently. May arrive anywhere in the stream.
    ParallelToolCalls,
}

/// A streamed model response. Errors terminate the stream.
pub type ModelStream = BoxStream<'static, Result<ModelChunk>>;

/// Everything a backend needs for one generation.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// The agent this request is generated for.
    pub agent: String,
}

/// A language model.
///
/// Transport failures should be reported as
/// [`AgentError::BackendTransport`](crate::AgentError::BackendTransport),
/// either from `generate` itself or as an error item in the stream.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start generating a response.
    async fn generate(&self, request: ModelRequest) -> Result<ModelStream>;

    /// Condense `text` to roughly `ratio` of its length.
    async fn summarize(&self, text: &str, ratio: f64) -> Result<String>;
}
