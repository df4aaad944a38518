//! Streaming event protocol.
//!
//! Each turn produces an ordered sequence of [`Event`]s delivered over a
//! bounded channel to a single subscriber. Sends await capacity, so a slow
//! subscriber slows the turn down rather than growing a buffer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::memory::RecallHit;

/// Default capacity of a turn's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a progress event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Tool,
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
}

/// A single event in a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start {
        session_id: String,
    },
    /// Reasoning trace from the backend.
    Thinking {
        content: String,
    },
    Progress {
        event: ProgressKind,
        name: String,
        status: ProgressStatus,
        #[serde(default)]
        detail: String,
    },
    /// Assistant text increment.
    Chunk {
        content: String,
    },
    Recall {
        hits: Vec<RecallHit>,
    },
    /// A tool call is waiting for a human decision.
    Approval {
        id: String,
        tool: String,
        args: Value,
    },
    Cancelled {},
    Done {},
    Error {
        message: String,
    },
}

impl Event {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled {} | Self::Done {} | Self::Error { .. })
    }
}

/// Sending half of a turn's event stream. A sink without a receiver drops
/// events, which is what [`Orchestrator::process_message`](crate::Orchestrator::process_message)
/// uses.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Create a bounded channel and a sink feeding it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Deliver an event. A dropped subscriber is not an error.
    pub async fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn progress(
        &self,
        event: ProgressKind,
        name: &str,
        status: ProgressStatus,
        detail: impl Into<String>,
    ) {
        self.emit(Event::Progress {
            event,
            name: name.to_owned(),
            status,
            detail: detail.into(),
        })
        .await;
    }
}
