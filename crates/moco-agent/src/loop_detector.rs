//! Repeated tool-call detection.
//!
//! Every call is reduced to a key of its name and canonical arguments and
//! pushed into a bounded per-scope window. A call whose key reaches the
//! repeat threshold inside the window is reported as a loop.

use std::collections::VecDeque;

use dashmap::DashMap;
use ring::digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{AgentError, Result};

/// Canonical arguments longer than this are replaced by their digest.
const MAX_INLINE_ARGS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    /// Identical calls within the window that count as a loop.
    pub repeat_threshold: usize,
    /// Number of recent calls remembered per scope.
    pub window_size: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeat_threshold: 3,
            window_size: 10,
        }
    }
}

impl LoopDetectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repeat_threshold < 2 {
            return Err(AgentError::ConfigError {
                reason: "loop_detection.repeat_threshold must be at least 2".into(),
            });
        }
        if self.window_size < self.repeat_threshold {
            return Err(AgentError::ConfigError {
                reason: "loop_detection.window_size must be at least repeat_threshold".into(),
            });
        }
        Ok(())
    }
}

/// Sliding-window loop detector, keyed by scope.
///
/// The runtime scopes windows by session, agent and delegation depth.
#[derive(Debug, Default)]
pub struct LoopDetector {
    config: LoopDetectionConfig,
    windows: DashMap<String, VecDeque<String>>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Record a call and report whether it completes a loop.
    pub fn check(&self, scope: &str, name: &str, arguments: &Value) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = call_key(name, arguments);
        let mut window = self.windows.entry(scope.to_owned()).or_default();
        window.push_back(key.clone());
        while window.len() > self.config.window_size {
            window.pop_front();
        }
        let count = window.iter().filter(|k| **k == key).count();
        if count >= self.config.repeat_threshold {
            warn!(scope, tool = name, count, "tool call loop detected");
            true
        } else {
            false
        }
    }

    /// Forget every window whose scope starts with `prefix`.
    pub fn reset(&self, prefix: &str) {
        self.windows.retain(|scope, _| !scope.starts_with(prefix));
    }

    /// Whether any window's scope starts with `prefix`.
    pub fn tracks(&self, prefix: &str) -> bool {
        self.windows.iter().any(|w| w.key().starts_with(prefix))
    }

    pub fn repeat_threshold(&self) -> usize {
        self.config.repeat_threshold
    }
}

/// `name:` followed by the canonical arguments, or by their SHA-256 digest
/// when the arguments are long.
pub fn call_key(name: &str, arguments: &Value) -> String {
    let canonical = canonical_json(arguments);
    if canonical.len() > MAX_INLINE_ARGS {
        let hash = digest::digest(&digest::SHA256, canonical.as_bytes());
        let hex: String = hash.as_ref().iter().map(|b| format!("{b:02x}")).collect();
        format!("{name}:hash:{hex}")
    } else {
        format!("{name}:{canonical}")
    }
}

/// Serialize with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_the_threshold_th_identical_call() {
        let d = LoopDetector::default();
        let args = json!({"path": "a.txt"});
        assert!(!d.check("s", "read_file", &args));
        assert!(!d.check("s", "read_file", &args));
        assert!(d.check("s", "read_file", &args));
    }

    #[test]
    fn key_order_does_not_matter() {
        assert_eq!(
            call_key("t", &json!({"a": 1, "b": {"y": 2, "x": 1}})),
            call_key("t", &json!({"b": {"x": 1, "y": 2}, "a": 1}))
        );
    }

    #[test]
    fn long_arguments_are_hashed() {
        let key = call_key("write", &json!({"content": "z".repeat(200)}));
        assert!(key.starts_with("write:hash:"));
        assert_eq!(key.len(), "write:hash:".len() + 64);
    }

    #[test]
    fn different_arguments_and_scopes_are_independent() {
        let d = LoopDetector::default();
        for i in 0..10 {
            assert!(!d.check("s", "read_file", &json!({"path": i})));
        }
        assert!(!d.check("s1", "t", &json!({})));
        assert!(!d.check("s1", "t", &json!({})));
        assert!(!d.check("s2", "t", &json!({})));
    }

    #[test]
    fn window_forgets_old_calls() {
        let d = LoopDetector::new(LoopDetectionConfig {
            enabled: true,
            repeat_threshold: 3,
            window_size: 4,
        });
        let same = json!({"q": 1});
        assert!(!d.check("s", "t", &same));
        assert!(!d.check("s", "t", &same));
        for i in 0..3 {
            assert!(!d.check("s", "other", &json!({"i": i})));
        }
        // Both earlier calls are out of the window by now.
        assert!(!d.check("s", "t", &same));
    }

    #[test]
    fn reset_clears_matching_scopes() {
        let d = LoopDetector::default();
        let args = json!({});
        d.check("sess1/agent@0", "t", &args);
        d.check("sess1/agent@0", "t", &args);
        d.check("sess2/agent@0", "t", &args);
        d.check("sess2/agent@0", "t", &args);
        d.reset("sess1/");
        assert!(!d.check("sess1/agent@0", "t", &args));
        assert!(d.check("sess2/agent@0", "t", &args));
    }

    #[test]
    fn disabled_detector_never_fires() {
        let d = LoopDetector::new(LoopDetectionConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..10 {
            assert!(!d.check("s", "t", &json!({})));
        }
    }
}
