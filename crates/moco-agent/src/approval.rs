//! Human approval for gated tool calls.
//!
//! The runtime opens a request, publishes it as an
//! [`Event::Approval`](crate::Event::Approval), and waits. Whoever holds the
//! orchestrator answers with [`ApprovalBroker::respond`]. No answer before
//! the timeout counts as a rejection.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Tools that need a human decision before they run.
    pub tools: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl ApprovalConfig {
    pub fn requires_approval(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// An outstanding approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub args: Value,
}

struct Pending {
    request: ApprovalRequest,
    reply: oneshot::Sender<bool>,
}

/// Correlates approval requests with their answers.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: DashMap<String, Pending>,
}

impl std::fmt::Debug for ApprovalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Await the receiver with [`ApprovalBroker::wait`].
    pub fn open(
        &self,
        session_id: &str,
        tool: &str,
        args: Value,
    ) -> (ApprovalRequest, oneshot::Receiver<bool>) {
        let request = ApprovalRequest {
            id: format!("apr_{}", uuid::Uuid::now_v7().simple()),
            session_id: session_id.to_owned(),
            tool: tool.to_owned(),
            args,
        };
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            request.id.clone(),
            Pending {
                request: request.clone(),
                reply,
            },
        );
        (request, rx)
    }

    /// Wait for the answer to `id`. Timeout and a dropped broker both mean no.
    pub async fn wait(&self, id: &str, rx: oneshot::Receiver<bool>, timeout: Duration) -> bool {
        let approved = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(approval_id = id, "approval timed out, treating as rejected");
                false
            }
        };
        self.pending.remove(id);
        approved
    }

    /// Answer a pending request. Returns false if the id is unknown or the
    /// request already expired.
    pub fn respond(&self, id: &str, approved: bool) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => {
                info!(approval_id = id, tool = %pending.request.tool, approved, "approval answered");
                pending.reply.send(approved).is_ok()
            }
            None => false,
        }
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<_> = self
            .pending
            .iter()
            .map(|entry| entry.value().request.clone())
            .collect();
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        requests
    }

    /// Drop every pending request of a session, rejecting them.
    pub fn cancel_session(&self, session_id: &str) {
        self.pending
            .retain(|_, pending| pending.request.session_id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn approved_request_resolves_true() {
        let broker = Arc::new(ApprovalBroker::new());
        let (req, rx) = broker.open("s", "execute_bash", json!({"command": "ls"}));
        assert_eq!(broker.pending(), vec![req.clone()]);

        let b = broker.clone();
        let id = req.id.clone();
        tokio::spawn(async move {
            assert!(b.respond(&id, true));
        });
        assert!(broker.wait(&req.id, rx, Duration::from_secs(5)).await);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_a_rejection() {
        let broker = ApprovalBroker::new();
        let (req, rx) = broker.open("s", "t", json!({}));
        assert!(!broker.wait(&req.id, rx, Duration::from_millis(20)).await);
        assert!(!broker.respond(&req.id, true));
    }

    #[tokio::test]
    async fn cancelled_session_rejects_its_requests() {
        let broker = ApprovalBroker::new();
        let (req, rx) = broker.open("s", "t", json!({}));
        let (_other, _rx2) = broker.open("other", "t", json!({}));
        broker.cancel_session("s");
        assert!(!broker.wait(&req.id, rx, Duration::from_secs(5)).await);
        assert_eq!(broker.pending().len(), 1);
    }

    #[test]
    fn unknown_id_is_ignored() {
        assert!(!ApprovalBroker::new().respond("apr_missing", true));
    }
}
