//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use moco_agent::{Event, Message, ModelBackend, ModelChunk, ModelRequest, ModelStream, Result};
use moco_tools::{Tool, ToolDefinition};
use serde_json::{Value, json};
use tokio::sync::mpsc;

type Responder = dyn Fn(&ModelRequest) -> Vec<ModelChunk> + Send + Sync;

/// A backend whose every reply is computed from the request it receives.
pub struct ScriptedBackend {
    respond: Box<Responder>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    pub fn new(respond: impl Fn(&ModelRequest) -> Vec<ModelChunk> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with `text`.
    pub fn replying(text: &'static str) -> Arc<Self> {
        Self::new(move |_| vec![ModelChunk::Text(text.into())])
    }

    /// Calls `tool` once with `args`, then answers with `text` as soon as
    /// the latest message is a tool result.
    pub fn tool_then_text(tool: &'static str, args: Value, text: &'static str) -> Arc<Self> {
        Self::new(move |req| {
            if last_is_tool_result(req) {
                vec![ModelChunk::Text(text.into())]
            } else {
                vec![tool_call(tool, args.clone())]
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(&self, request: ModelRequest) -> Result<ModelStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn summarize(&self, _text: &str, _ratio: f64) -> Result<String> {
        Ok("summary".into())
    }
}

pub fn tool_call(name: &str, args: Value) -> ModelChunk {
    ModelChunk::ToolCall(moco_agent::ToolCall::new("", name, args))
}

pub fn last_is_tool_result(req: &ModelRequest) -> bool {
    req.messages
        .last()
        .is_some_and(|m: &Message| m.tool_call_id.is_some())
}

/// Echoes its `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echo text back",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        )
    }

    async fn execute(&self, arguments: Value) -> moco_tools::Result<String> {
        Ok(arguments["text"].as_str().unwrap_or_default().to_owned())
    }
}

/// Sleeps far longer than any test waits.
pub struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("slow", "Takes a long time", json!({"type": "object"}))
    }

    async fn execute(&self, _arguments: Value) -> moco_tools::Result<String> {
        tokio::time::sleep(Duration::from_secs(20)).await;
        Ok("finished".into())
    }
}

/// Drain `rx` until the terminal event, failing after five seconds.
pub async fn collect_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            let last = event.is_terminal();
            events.push(event);
            if last {
                break;
            }
        }
    })
    .await
    .expect("turn did not finish in time");
    events
}
