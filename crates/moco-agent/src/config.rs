//! Top-level configuration, read from `moco.toml`.
//!
//! Every section is optional and falls back to its defaults:
//!
//! ```toml
//! agents_dir = ".moco/agents"
//! default_agent = "orchestrator"
//!
//! [runtime]
//! max_iterations = 20
//! max_delegation_depth = 5
//!
//! [guardrails]
//! blocked_tools = ["execute_bash"]
//!
//! [checkpoint]
//! auto_save_interval = 2
//!
//! [[mcp.servers]]
//! name = "fs"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "."]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use moco_store::CheckpointConfig;
use moco_tools::McpConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::approval::ApprovalConfig;
use crate::compressor::CompressionConfig;
use crate::error::{AgentError, Result};
use crate::guardrails::GuardrailConfig;
use crate::loop_detector::LoopDetectionConfig;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "moco.toml";

/// Limits for the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Model calls per agent run before the run is abandoned.
    pub max_iterations: u32,
    /// Deepest allowed delegation chain.
    pub max_delegation_depth: u32,
    /// Concurrent tool calls when the model marks them parallel.
    pub max_parallel_tools: usize,
    /// Pause before the single retry of a failed model call.
    pub backend_retry_backoff_ms: u64,
    pub tool_timeout_secs: u64,
    /// Messages of a delegate's previous work it sees again.
    pub sub_session_history: usize,
    pub event_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_delegation_depth: 5,
            max_parallel_tools: 4,
            backend_retry_backoff_ms: 500,
            tool_timeout_secs: 30,
            sub_session_history: 10,
            event_channel_capacity: crate::events::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.backend_retry_backoff_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("runtime.max_iterations", self.max_iterations as usize),
            ("runtime.max_parallel_tools", self.max_parallel_tools),
            ("runtime.tool_timeout_secs", self.tool_timeout_secs as usize),
            ("runtime.event_channel_capacity", self.event_channel_capacity),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(AgentError::ConfigError {
                    reason: format!("{name} must be greater than 0"),
                });
            }
        }
        Ok(())
    }
}

/// The whole `moco.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MocoConfig {
    /// Directory of agent definition files.
    pub agents_dir: Option<PathBuf>,
    /// Agent that owns new sessions.
    pub default_agent: Option<String>,
    pub runtime: RuntimeConfig,
    pub guardrails: GuardrailConfig,
    pub compression: CompressionConfig,
    pub checkpoint: CheckpointConfig,
    pub loop_detection: LoopDetectionConfig,
    pub approval: ApprovalConfig,
    pub mcp: McpConfig,
}

impl MocoConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        self.compression.validate()?;
        self.loop_detection.validate()?;
        self.checkpoint.validate().map_err(|e| AgentError::ConfigError {
            reason: format!("checkpoint: {e}"),
        })?;
        Ok(())
    }
}
