//! Context compression -- summarize old conversation messages once the
//! history outgrows its token budget.
//!
//! When [`ContextCompressor::estimate_tokens`] exceeds
//! [`CompressionConfig::max_tokens`], the compressor:
//!
//! 1. Pulls every system message to the front.
//! 2. Keeps the most recent `preserve_recent` non-system messages verbatim.
//! 3. Asks the backend to summarize everything older.
//! 4. Returns `[system..., summary, ...recent]`.
//!
//! An earlier summary is treated like any other old message, so a history
//! never carries more than one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::llm::{Message, ModelBackend, Role};

/// Prefix of the synthetic summary message.
pub const SUMMARY_PREFIX: &str = "[Context summary of ";

/// Per-message cap when formatting the old segment for summarization.
const MAX_FORMATTED_CHARS: usize = 2000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Estimated token count above which compression kicks in.
    pub max_tokens: usize,
    /// Non-system messages always kept verbatim.
    pub preserve_recent: usize,
    /// Target summary length as a fraction of the summarized text.
    pub compression_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 200_000,
            preserve_recent: 10,
            compression_ratio: 0.5,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(AgentError::ConfigError {
                reason: "compression.max_tokens must be greater than 0".into(),
            });
        }
        if !(self.compression_ratio > 0.0 && self.compression_ratio < 1.0) {
            return Err(AgentError::ConfigError {
                reason: format!(
                    "compression.compression_ratio must be in (0, 1), got {}",
                    self.compression_ratio
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Approximate token counting. Implementations must be deterministic and
/// never decrease when content grows.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, messages: &[Message]) -> usize;
}

/// Character-count heuristic: `ceil(chars * tokens_per_char)` plus a fixed
/// overhead per message.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    pub tokens_per_char: f64,
    pub per_message_overhead: usize,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self {
            tokens_per_char: 1.5,
            per_message_overhead: 4,
        }
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, messages: &[Message]) -> usize {
        let chars: usize = messages
            .iter()
            .map(|m| {
                let calls: usize = m
                    .tool_calls
                    .iter()
                    .map(|c| c.name.chars().count() + c.arguments.to_string().chars().count())
                    .sum();
                m.content.chars().count() + calls
            })
            .sum();
        (chars as f64 * self.tokens_per_char).ceil() as usize
            + messages.len() * self.per_message_overhead
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

pub struct ContextCompressor {
    config: CompressionConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for ContextCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCompressor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            estimator: Arc::new(CharEstimator::default()),
        }
    }

    /// Replace the default [`CharEstimator`].
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        self.estimator.estimate(messages)
    }

    /// Compress `messages` if they exceed the token budget.
    ///
    /// Returns the (possibly new) history and whether it was compressed.
    /// A failed or empty summary leaves the history untouched.
    pub async fn compress_if_needed(
        &self,
        messages: &[Message],
        backend: &dyn ModelBackend,
    ) -> (Vec<Message>, bool) {
        let estimate = self.estimate_tokens(messages);
        if estimate <= self.config.max_tokens {
            return (messages.to_vec(), false);
        }

        let (system, conversation): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.is_system());

        if conversation.len() <= self.config.preserve_recent {
            debug!(
                estimate,
                conversation = conversation.len(),
                "over budget but nothing old enough to compress"
            );
            return (messages.to_vec(), false);
        }

        // Never start the preserved window on a tool result whose call
        // would be summarized away.
        let mut split = conversation.len() - self.config.preserve_recent;
        while split > 0 && split < conversation.len() && conversation[split].role == Role::Tool {
            split -= 1;
        }
        let (older, recent) = conversation.split_at(split);

        if older.is_empty() || (older.len() == 1 && is_summary(older[0])) {
            return (messages.to_vec(), false);
        }

        info!(
            estimate,
            older = older.len(),
            recent = recent.len(),
            "compressing conversation history"
        );

        let text = format_for_summary(older);
        let summary = match backend.summarize(&text, self.config.compression_ratio).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                warn!("summarizer returned an empty summary, keeping original history");
                return (messages.to_vec(), false);
            }
            Err(e) => {
                warn!(error = %e, "summarization failed, keeping original history");
                return (messages.to_vec(), false);
            }
        };

        let mut compressed = Vec::with_capacity(system.len() + 1 + recent.len());
        compressed.extend(system.into_iter().cloned());
        compressed.push(Message::assistant(format!(
            "{SUMMARY_PREFIX}{} earlier messages]\n{}",
            older.len(),
            summary.trim()
        )));
        compressed.extend(recent.iter().map(|m| (*m).clone()));

        debug!(
            before = messages.len(),
            after = compressed.len(),
            estimate_after = self.estimate_tokens(&compressed),
            "compression complete"
        );
        (compressed, true)
    }
}

/// Whether `message` is a summary produced by [`ContextCompressor`].
pub fn is_summary(message: &Message) -> bool {
    message.role == Role::Assistant && message.content.starts_with(SUMMARY_PREFIX)
}

/// Render messages as `[role]: content` lines for the summarizer.
fn format_for_summary(messages: &[&Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let mut content: String = msg.content.chars().take(MAX_FORMATTED_CHARS).collect();
        if content.len() < msg.content.len() {
            content.push_str("...(truncated)");
        }
        out.push_str(&format!("[{}]: {content}\n", msg.role));
        for call in &msg.tool_calls {
            out.push_str(&format!("[tool_call: {}({})]\n", call.name, call.arguments));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelRequest, ModelStream, ToolCall};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Summarizes to a fixed short string and counts calls.
    #[derive(Default)]
    struct FixedSummary {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ModelBackend for FixedSummary {
        async fn generate(&self, _request: ModelRequest) -> Result<ModelStream> {
            Err(AgentError::Internal("not used".into()))
        }

        async fn summarize(&self, _text: &str, _ratio: f64) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AgentError::BackendTransport {
                    reason: "offline".into(),
                })
            } else {
                Ok("short".into())
            }
        }
    }

    fn compressor(max_tokens: usize, preserve_recent: usize) -> ContextCompressor {
        ContextCompressor::new(CompressionConfig {
            max_tokens,
            preserve_recent,
            compression_ratio: 0.5,
        })
    }

    fn history(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("you are helpful")];
        for i in 0..n {
            if i % 2 == 0 {
                msgs.push(Message::user(format!("question {i} {}", "x".repeat(50))));
            } else {
                msgs.push(Message::assistant(format!("answer {i} {}", "y".repeat(50))));
            }
        }
        msgs
    }

    #[test]
    fn estimate_is_monotonic() {
        let est = CharEstimator::default();
        let mut msgs = vec![Message::user("a")];
        let mut last = est.estimate(&msgs);
        for _ in 0..20 {
            msgs[0].content.push('b');
            let next = est.estimate(&msgs);
            assert!(next >= last);
            last = next;
        }
        let mut with_call = Message::assistant("");
        with_call
            .tool_calls
            .push(ToolCall::new("c", "t", serde_json::json!({"k": "v"})));
        assert!(est.estimate(&[with_call]) > est.estimate(&[Message::assistant("")]));
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let backend = FixedSummary::default();
        let msgs = history(4);
        let (out, compressed) = compressor(1_000_000, 2).compress_if_needed(&msgs, &backend).await;
        assert!(!compressed);
        assert_eq!(out, msgs);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keeps_system_and_recent_messages() {
        let backend = FixedSummary::default();
        let msgs = history(12);
        let (out, compressed) = compressor(10, 4).compress_if_needed(&msgs, &backend).await;
        assert!(compressed);
        assert_eq!(out.len(), 1 + 1 + 4);
        assert!(out[0].is_system());
        assert!(is_summary(&out[1]));
        assert!(out[1].content.starts_with("[Context summary of 8 earlier messages]"));
        assert_eq!(&out[2..], &msgs[msgs.len() - 4..]);
    }

    #[tokio::test]
    async fn compression_is_idempotent() {
        let backend = FixedSummary::default();
        let c = compressor(10, 4);
        let (once, _) = c.compress_if_needed(&history(12), &backend).await;
        let (twice, compressed) = c.compress_if_needed(&once, &backend).await;
        assert!(!compressed);
        assert_eq!(once, twice);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn old_summary_is_folded_into_the_new_one() {
        let backend = FixedSummary::default();
        let c = compressor(10, 4);
        let (mut once, _) = c.compress_if_needed(&history(12), &backend).await;
        for i in 0..6 {
            once.push(Message::user(format!("more {i}")));
        }
        let (twice, compressed) = c.compress_if_needed(&once, &backend).await;
        assert!(compressed);
        assert_eq!(twice.iter().filter(|m| is_summary(m)).count(), 1);
        assert_eq!(&twice[twice.len() - 4..], &once[once.len() - 4..]);
    }

    #[tokio::test]
    async fn failed_summary_keeps_history() {
        let backend = FixedSummary {
            fail: true,
            ..Default::default()
        };
        let msgs = history(12);
        let (out, compressed) = compressor(10, 4).compress_if_needed(&msgs, &backend).await;
        assert!(!compressed);
        assert_eq!(out, msgs);
    }

    #[tokio::test]
    async fn preserved_window_does_not_start_on_a_tool_result() {
        let backend = FixedSummary::default();
        let mut msgs = history(6);
        msgs.push(Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("c1", "t", serde_json::json!({}))],
        ));
        msgs.push(Message::tool_result(&moco_tools::ToolResult::ok("c1", "out")));
        msgs.push(Message::assistant("done"));

        let (out, compressed) = compressor(10, 2).compress_if_needed(&msgs, &backend).await;
        assert!(compressed);
        let first_recent = &out[2];
        assert_eq!(first_recent.tool_calls.len(), 1);
        assert_eq!(&out[2..], &msgs[msgs.len() - 3..]);
    }

    #[tokio::test]
    async fn zero_preserved_summarizes_everything() {
        let backend = FixedSummary::default();
        let msgs = vec![Message::user("hello"), Message::assistant("hi there")];
        let c = compressor(1, 0);
        let (out, compressed) = c.compress_if_needed(&msgs, &backend).await;
        assert!(compressed);
        assert_eq!(out.len(), 1);
        assert!(out[0].content.starts_with("[Context summary of 2 earlier messages]"));

        let (again, compressed) = c.compress_if_needed(&out, &backend).await;
        assert!(!compressed);
        assert_eq!(again, out);
    }

    #[test]
    fn config_validation() {
        assert!(CompressionConfig::default().validate().is_ok());
        let bad = CompressionConfig {
            compression_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
