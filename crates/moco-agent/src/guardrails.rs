//! Guardrail pipeline for inputs, outputs, and tool calls.
//!
//! Each check runs a fixed sequence of stages followed by the registered
//! custom validators. The first `Block` short-circuits. `Warn` and `Modify`
//! results accumulate, and a `Modify` replaces the text that later stages
//! see. The policy lives behind an `RwLock` so one pipeline can be shared by
//! every session while admin operations change it.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Shell patterns flagged by the dangerous-pattern check.
const DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+-[a-z]*r[a-z]*f[a-z]*\s+/",
    r"rm\s+-[a-z]*f[a-z]*r[a-z]*\s+/",
    r"rm\s+--recursive.*--force",
    r":\(\)\s*\{\s*:\|:&\s*\}\s*;:",
    r">\s*/dev/sd[a-z]",
    r"dd\s+if=.*of=/dev/",
    r"mkfs\.",
    r"chmod\s+(-R\s+)?777\s+/",
    r"curl.*\|\s*(ba)?sh",
    r"wget.*\|\s*(ba)?sh",
];

const OUTPUT_TRUNCATION_NOTICE: &str = "\n\n[Output truncated: exceeded the maximum length]";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    Allow,
    Block,
    Modify,
    Warn,
}

/// The decision of a guardrail check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub action: GuardrailAction,
    pub message: String,
    /// Replacement content, set for `Modify`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_content: Option<String>,
}

impl GuardrailResult {
    pub fn allow() -> Self {
        Self {
            action: GuardrailAction::Allow,
            message: String::new(),
            modified_content: None,
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            action: GuardrailAction::Block,
            message: message.into(),
            modified_content: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            action: GuardrailAction::Warn,
            message: message.into(),
            modified_content: None,
        }
    }

    pub fn modify(message: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            action: GuardrailAction::Modify,
            message: message.into(),
            modified_content: Some(content.into()),
        }
    }

    /// False only for `Block`.
    pub fn is_allowed(&self) -> bool {
        self.action != GuardrailAction::Block
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// A custom check over input or output text.
pub trait TextValidator: Send + Sync {
    fn validate(&self, text: &str) -> GuardrailResult;
}

impl<F> TextValidator for F
where
    F: Fn(&str) -> GuardrailResult + Send + Sync,
{
    fn validate(&self, text: &str) -> GuardrailResult {
        self(text)
    }
}

/// A custom check over a proposed tool call.
pub trait ToolValidator: Send + Sync {
    fn validate(&self, name: &str, arguments: &Value) -> GuardrailResult;
}

impl<F> ToolValidator for F
where
    F: Fn(&str, &Value) -> GuardrailResult + Send + Sync,
{
    fn validate(&self, name: &str, arguments: &Value) -> GuardrailResult {
        self(name, arguments)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static guardrail policy, usually the `[guardrails]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub max_input_length: usize,
    pub max_output_length: usize,
    pub max_tool_calls_per_turn: usize,
    /// Regexes matched case-insensitively against inputs and outputs.
    pub blocked_patterns: Vec<String>,
    pub blocked_tools: Vec<String>,
    /// When set, only these tools may be called.
    pub allowed_tools: Option<Vec<String>>,
    pub enable_dangerous_pattern_check: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_input_length: 100_000,
            max_output_length: 50_000,
            max_tool_calls_per_turn: 20,
            blocked_patterns: Vec::new(),
            blocked_tools: Vec::new(),
            allowed_tools: None,
            enable_dangerous_pattern_check: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Policy {
    max_input_length: usize,
    max_output_length: usize,
    max_tool_calls_per_turn: usize,
    blocked_patterns: Vec<Regex>,
    blocked_tools: HashSet<String>,
    allowed_tools: Option<HashSet<String>>,
    dangerous_check: bool,
    input_validators: Vec<Arc<dyn TextValidator>>,
    output_validators: Vec<Arc<dyn TextValidator>>,
    tool_validators: Vec<Arc<dyn ToolValidator>>,
}

/// Shared, mutable guardrail policy.
pub struct GuardrailPipeline {
    policy: RwLock<Policy>,
    dangerous: Vec<Regex>,
}

impl std::fmt::Debug for GuardrailPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let policy = self.read();
        f.debug_struct("GuardrailPipeline")
            .field("max_input_length", &policy.max_input_length)
            .field("max_output_length", &policy.max_output_length)
            .field("blocked_patterns", &policy.blocked_patterns.len())
            .field("blocked_tools", &policy.blocked_tools)
            .field("allowed_tools", &policy.allowed_tools)
            .finish_non_exhaustive()
    }
}

impl Default for GuardrailPipeline {
    fn default() -> Self {
        Self::build(&GuardrailConfig::default(), Vec::new())
    }
}

impl GuardrailPipeline {
    /// Build a pipeline, compiling the configured patterns.
    pub fn new(config: &GuardrailConfig) -> Result<Self> {
        let patterns = config
            .blocked_patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::build(config, patterns))
    }

    fn build(config: &GuardrailConfig, blocked_patterns: Vec<Regex>) -> Self {
        let dangerous = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|p| compile_pattern(p).ok())
            .collect();
        Self {
            policy: RwLock::new(Policy {
                max_input_length: config.max_input_length,
                max_output_length: config.max_output_length,
                max_tool_calls_per_turn: config.max_tool_calls_per_turn,
                blocked_patterns,
                blocked_tools: config.blocked_tools.iter().cloned().collect(),
                allowed_tools: config
                    .allowed_tools
                    .as_ref()
                    .map(|tools| tools.iter().cloned().collect()),
                dangerous_check: config.enable_dangerous_pattern_check,
                input_validators: Vec::new(),
                output_validators: Vec::new(),
                tool_validators: Vec::new(),
            }),
            dangerous,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Policy> {
        self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Policy> {
        self.policy.write().unwrap_or_else(|e| e.into_inner())
    }

    // -- checks --------------------------------------------------------------

    /// Validate user input.
    pub fn validate_input(&self, text: &str) -> GuardrailResult {
        let policy = self.read();
        let length = text.chars().count();
        if length > policy.max_input_length {
            return logged(
                "input",
                GuardrailResult::block(format!(
                    "Input is too long ({length} characters, limit {})",
                    policy.max_input_length
                )),
            );
        }
        let verdict = self.scan_text(&policy, "Input", text, &policy.input_validators);
        logged("input", verdict)
    }

    /// Validate model output. Over-long output is truncated, not blocked.
    pub fn validate_output(&self, text: &str) -> GuardrailResult {
        let policy = self.read();
        let length = text.chars().count();
        let mut verdict = Verdict::new(text);
        if length > policy.max_output_length {
            let mut truncated: String = text.chars().take(policy.max_output_length).collect();
            truncated.push_str(OUTPUT_TRUNCATION_NOTICE);
            verdict.absorb(GuardrailResult::modify(
                format!(
                    "Output truncated from {length} to {} characters",
                    policy.max_output_length
                ),
                truncated,
            ));
        }
        let rest = self.scan_text(
            &policy,
            "Output",
            verdict.content(),
            &policy.output_validators,
        );
        if let Some(block) = verdict.absorb(rest) {
            return logged("output", block);
        }
        logged("output", verdict.finish())
    }

    /// Whether `text` matches any blocked pattern. Streamed output is
    /// checked as a whole with this, so a pattern split across chunks
    /// still blocks.
    pub fn matches_blocked_pattern(&self, text: &str) -> bool {
        self.read()
            .blocked_patterns
            .iter()
            .any(|re| re.is_match(text))
    }

    /// Validate a proposed tool call.
    ///
    /// `calls_this_turn` is how many calls the agent has already attempted
    /// in the current turn; the budget check uses it.
    pub fn validate_tool_call(
        &self,
        name: &str,
        arguments: &Value,
        calls_this_turn: usize,
    ) -> GuardrailResult {
        let policy = self.read();

        match &policy.allowed_tools {
            Some(allowed) if !allowed.contains(name) => {
                return logged(
                    "tool",
                    GuardrailResult::block(format!("Tool '{name}' is not in the allowed list")),
                );
            }
            Some(_) => {}
            None if policy.blocked_tools.contains(name) => {
                return logged(
                    "tool",
                    GuardrailResult::block(format!("Tool '{name}' is blocked")),
                );
            }
            None => {}
        }

        if calls_this_turn >= policy.max_tool_calls_per_turn {
            return logged(
                "tool",
                GuardrailResult::block(format!(
                    "Tool call limit reached ({calls_this_turn}/{})",
                    policy.max_tool_calls_per_turn
                )),
            );
        }

        let serialized = arguments.to_string();
        let mut verdict = Verdict::new(&serialized);
        if policy.dangerous_check && self.dangerous.iter().any(|re| re.is_match(&serialized)) {
            verdict.absorb(GuardrailResult::warn(
                "Dangerous pattern detected in tool arguments",
            ));
        }
        for validator in &policy.tool_validators {
            if let Some(block) = verdict.absorb(validator.validate(name, arguments)) {
                return logged("tool", block);
            }
        }
        logged("tool", verdict.finish())
    }

    fn scan_text(
        &self,
        policy: &Policy,
        label: &str,
        text: &str,
        validators: &[Arc<dyn TextValidator>],
    ) -> GuardrailResult {
        if let Some(re) = policy.blocked_patterns.iter().find(|re| re.is_match(text)) {
            debug!(pattern = re.as_str(), "blocked pattern matched");
            return GuardrailResult::block(format!("{label} contains a blocked pattern"));
        }

        let mut verdict = Verdict::new(text);
        if policy.dangerous_check && self.dangerous.iter().any(|re| re.is_match(text)) {
            verdict.absorb(GuardrailResult::warn(format!(
                "{label} contains a dangerous pattern"
            )));
        }
        for validator in validators {
            let result = validator.validate(verdict.content());
            if let Some(block) = verdict.absorb(result) {
                return block;
            }
        }
        verdict.finish()
    }

    // -- mutators ------------------------------------------------------------

    /// Add a case-insensitive blocked pattern.
    pub fn add_blocked_pattern(&self, pattern: &str) -> Result<()> {
        let re = compile_pattern(pattern)?;
        self.write().blocked_patterns.push(re);
        Ok(())
    }

    pub fn add_blocked_tool(&self, name: impl Into<String>) {
        self.write().blocked_tools.insert(name.into());
    }

    /// Returns whether the tool was blocked.
    pub fn remove_blocked_tool(&self, name: &str) -> bool {
        self.write().blocked_tools.remove(name)
    }

    /// Set or clear the allow-list.
    pub fn set_allowed_tools(&self, tools: Option<Vec<String>>) {
        self.write().allowed_tools = tools.map(|t| t.into_iter().collect());
    }

    pub fn add_input_validator(&self, validator: impl TextValidator + 'static) {
        self.write().input_validators.push(Arc::new(validator));
    }

    pub fn add_output_validator(&self, validator: impl TextValidator + 'static) {
        self.write().output_validators.push(Arc::new(validator));
    }

    pub fn add_tool_validator(&self, validator: impl ToolValidator + 'static) {
        self.write().tool_validators.push(Arc::new(validator));
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AgentError::ConfigError {
            reason: format!("invalid guardrail pattern `{pattern}`: {e}"),
        })
}

fn logged(stage: &str, result: GuardrailResult) -> GuardrailResult {
    if result.action != GuardrailAction::Allow {
        warn!(stage, action = ?result.action, message = %result.message, "guardrail triggered");
    }
    result
}

/// Accumulates non-blocking results across stages.
struct Verdict {
    content: String,
    modified: bool,
    notes: Vec<String>,
}

impl Verdict {
    fn new(content: &str) -> Self {
        Self {
            content: content.to_owned(),
            modified: false,
            notes: Vec::new(),
        }
    }

    fn content(&self) -> &str {
        &self.content
    }

    /// Fold a stage result in. Returns the result back if it blocks.
    fn absorb(&mut self, result: GuardrailResult) -> Option<GuardrailResult> {
        match result.action {
            GuardrailAction::Allow => None,
            GuardrailAction::Block => Some(result),
            GuardrailAction::Warn => {
                self.notes.push(result.message);
                None
            }
            GuardrailAction::Modify => {
                if let Some(content) = result.modified_content {
                    self.content = content;
                    self.modified = true;
                }
                self.notes.push(result.message);
                None
            }
        }
    }

    fn finish(self) -> GuardrailResult {
        let message = self
            .notes
            .into_iter()
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        if self.modified {
            GuardrailResult::modify(message, self.content)
        } else if !message.is_empty() {
            GuardrailResult::warn(message)
        } else {
            GuardrailResult::allow()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
