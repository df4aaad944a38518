//! Per-session cancellation tokens.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
struct Entry {
    token: CancellationToken,
    /// Turns started or queued on the session that have not finished.
    holders: usize,
}

/// Maps session ids to the token of their running and queued turns.
///
/// A turn takes its token when it is submitted, before it waits for the
/// session, so a cancel issued right after submission is never lost.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: DashMap<String, Entry>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a token for a new turn. A live token is shared; a cancelled one
    /// is replaced for this and later turns.
    pub fn create(&self, session_id: &str) -> CancellationToken {
        let mut entry = self
            .tokens
            .entry(session_id.to_owned())
            .or_insert_with(|| Entry {
                token: CancellationToken::new(),
                holders: 0,
            });
        if entry.token.is_cancelled() {
            entry.token = CancellationToken::new();
        }
        entry.holders += 1;
        entry.token.clone()
    }

    /// Cancel the session's pending turns. Returns false when none exist.
    pub fn request_cancel(&self, session_id: &str) -> bool {
        match self.tokens.get(session_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(session_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.tokens
            .get(session_id)
            .is_some_and(|entry| entry.token.is_cancelled())
    }

    /// Release one turn's hold. The token goes with the last holder.
    pub fn clear(&self, session_id: &str) {
        self.tokens.remove_if_mut(session_id, |_, entry| {
            entry.holders = entry.holders.saturating_sub(1);
            entry.holders == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_only_reaches_running_turns() {
        let registry = CancelRegistry::new();
        assert!(!registry.request_cancel("s1"));

        let token = registry.create("s1");
        assert!(registry.request_cancel("s1"));
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled("s1"));
        registry.clear("s1");

        let fresh = registry.create("s1");
        assert!(!fresh.is_cancelled());
        assert!(!registry.is_cancelled("s1"));

        registry.clear("s1");
        assert!(!registry.request_cancel("s1"));
    }

    #[test]
    fn live_token_is_shared() {
        let registry = CancelRegistry::new();
        let a = registry.create("s");
        let b = registry.create("s");
        registry.request_cancel("s");
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn queued_turn_stays_cancellable_after_the_first_ends() {
        let registry = CancelRegistry::new();
        let _first = registry.create("s");
        let second = registry.create("s");
        registry.clear("s");

        assert!(registry.request_cancel("s"));
        assert!(second.is_cancelled());
        registry.clear("s");
        assert!(!registry.request_cancel("s"));
    }

    #[test]
    fn cancel_before_the_turn_starts_is_kept() {
        let registry = CancelRegistry::new();
        let token = registry.create("s");
        assert!(registry.request_cancel("s"));
        assert!(token.is_cancelled());
    }
}
