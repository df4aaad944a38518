//! One invocation surface over local tools and MCP tools.
//!
//! [`ToolGateway::invoke`] never fails: every error comes back as a failed
//! [`ToolResult`] so the agent can show it to the model and carry on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, ToolError};
use crate::mcp::McpClient;
use crate::tool::{Tool, truncate_tool_output, validate_arguments};
use crate::types::{ToolDefinition, ToolResult};

/// Registry of local tools plus an optional MCP client.
#[derive(Clone)]
pub struct ToolGateway {
    local: HashMap<String, Arc<dyn Tool>>,
    mcp: Option<Arc<McpClient>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.local.keys().collect();
        names.sort();
        f.debug_struct("ToolGateway")
            .field("local", &names)
            .field("mcp", &self.mcp.is_some())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for ToolGateway {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ToolGateway {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            local: HashMap::new(),
            mcp: None,
            default_timeout,
        }
    }

    /// Register a local tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        debug!(tool = %name, "local tool registered");
        self.local.insert(name, tool);
    }

    /// Builder form of [`ToolGateway::register`].
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Route `server__tool` names to `client`.
    pub fn with_mcp(mut self, client: Arc<McpClient>) -> Self {
        self.mcp = Some(client);
        self
    }

    pub fn mcp(&self) -> Option<&Arc<McpClient>> {
        self.mcp.as_ref()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Local definitions sorted by name, followed by MCP definitions.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.local.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(mcp) = &self.mcp {
            defs.extend(mcp.tool_definitions().await);
        }
        defs
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        if self.local.contains_key(name) {
            return true;
        }
        match &self.mcp {
            Some(mcp) => mcp.has_tool(name).await,
            None => false,
        }
    }

    /// Check arguments against a local tool's schema.
    ///
    /// MCP tools validate their own arguments server-side, so only the
    /// JSON-object shape is checked for them.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<()> {
        match self.local.get(name) {
            Some(tool) => validate_arguments(&tool.definition(), arguments),
            None if arguments.is_object() => Ok(()),
            None => Err(ToolError::InvalidArguments {
                tool_name: name.to_owned(),
                reason: "arguments must be a JSON object".into(),
            }),
        }
    }

    /// Run a tool. `timeout` falls back to the gateway default.
    pub async fn invoke(
        &self,
        tool_call_id: &str,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let timeout = timeout.unwrap_or(self.default_timeout);

        if let Some(tool) = self.local.get(name) {
            let outcome = match self.validate(name, &arguments) {
                Ok(()) => tokio::time::timeout(timeout, tool.execute(arguments))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ToolError::Timeout {
                            tool_name: name.to_owned(),
                            millis: timeout.as_millis(),
                        })
                    }),
                Err(e) => Err(e),
            };
            return match outcome {
                Ok(text) => ToolResult::ok(tool_call_id, truncate_tool_output(text, name)),
                Err(e) => {
                    warn!(tool = name, error = %e, "local tool failed");
                    ToolResult::from_error(tool_call_id, &e)
                }
            };
        }

        match &self.mcp {
            Some(mcp) => {
                let mut result = mcp.call_tool(tool_call_id, name, arguments, timeout).await;
                if result.success {
                    result.content = truncate_tool_output(result.content, name);
                }
                result
            }
            None => ToolResult::from_error(
                tool_call_id,
                &ToolError::NotFound {
                    tool_name: name.to_owned(),
                },
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
