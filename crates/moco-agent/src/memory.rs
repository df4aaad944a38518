//! Semantic recall capability.
//!
//! Recall is best-effort: the orchestrator logs a failed search and carries
//! on with the turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One memory returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub content: String,
    /// Similarity score, higher is closer.
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Read-only access to a semantic memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RecallHit>>;
}

/// Render hits as a block appended to an agent's system prompt.
pub fn recall_context(hits: &[RecallHit]) -> Option<String> {
    if hits.is_empty() {
        return None;
    }
    let mut out = String::from("Relevant memories:");
    for hit in hits {
        out.push_str("\n- ");
        out.push_str(&hit.content);
    }
    Some(out)
}
