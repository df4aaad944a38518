//! Connection management and tool routing across MCP servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, ToolError};
use crate::mcp::protocol::{
    JsonRpcRequest, McpToolDefinition, McpToolResult, ToolsListResult, initialize_params,
};
use crate::mcp::transport::{HttpTransport, StdioTransport, Transport};
use crate::mcp::{
    ALLOWED_COMMANDS, McpConfig, McpServerConfig, McpTransportConfig, NAME_SEPARATOR,
    is_allowed_command,
};
use crate::types::{ToolDefinition, ToolResult};

/// `{server}__{tool}`.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{tool}")
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An initialized server and the tools it advertised.
///
/// Calls are not serialized. Each request takes a fresh id from `next_id`
/// and the transport hands every reply to the caller waiting on that id,
/// so concurrent calls share the connection.
struct McpConnection {
    name: String,
    transport: Box<dyn Transport>,
    next_id: AtomicU64,
    tools: Vec<McpToolDefinition>,
}

impl McpConnection {
    /// Launch the transport, run the handshake and fetch the tool catalog.
    async fn open(config: &McpServerConfig, allowed_commands: &[String]) -> Result<Self> {
        let transport: Box<dyn Transport> = match &config.transport {
            McpTransportConfig::Stdio { command, args, env } => {
                if !is_allowed_command(command, allowed_commands) {
                    return Err(ToolError::CommandNotAllowed {
                        server: config.name.clone(),
                        command: command.clone(),
                    });
                }
                Box::new(StdioTransport::spawn(&config.name, command, args, env)?)
            }
            McpTransportConfig::Http { url } => Box::new(HttpTransport::new(&config.name, url)?),
        };

        let mut conn = Self {
            name: config.name.clone(),
            transport,
            next_id: AtomicU64::new(1),
            tools: Vec::new(),
        };

        if let Err(e) = conn.handshake().await {
            let _ = conn.transport.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<()> {
        let init = self.call("initialize", Some(initialize_params())).await?;
        debug!(server = %self.name, response = %init, "mcp server initialized");

        self.transport
            .notify(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            ))
            .await?;

        let listed = self.call("tools/list", Some(json!({}))).await?;
        let listed: ToolsListResult =
            serde_json::from_value(listed).map_err(|e| ToolError::Protocol {
                server: self.name.clone(),
                reason: format!("invalid tools/list result: {e}"),
            })?;
        self.tools = listed.tools;
        Ok(())
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .transport
            .request(JsonRpcRequest::new(id, method, params))
            .await?;
        response.into_result().map_err(|e| ToolError::Protocol {
            server: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Outcome of [`McpClient::connect`], one entry per configured server.
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// `(server, tool count)` for every server that came up.
    pub connected: Vec<(String, usize)>,
    /// Servers that failed; the others are unaffected.
    pub failed: Vec<(String, ToolError)>,
}

impl ConnectReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct ClientState {
    connections: HashMap<String, Arc<McpConnection>>,
    /// Qualified tool name to `(server, original tool name)`.
    routes: HashMap<String, (String, String)>,
}

/// Client for any number of MCP servers. Shared across sessions via `Arc`.
pub struct McpClient {
    state: RwLock<ClientState>,
    connect_timeout: Duration,
    allowed_commands: Vec<String>,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl McpClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(ClientState::default()),
            connect_timeout,
            allowed_commands: ALLOWED_COMMANDS.iter().map(|c| (*c).to_owned()).collect(),
        }
    }

    /// Client honouring the timeouts and launcher allow-list of `config`.
    pub fn from_config(config: &McpConfig) -> Self {
        Self::new(Duration::from_secs(config.connect_timeout_secs))
            .with_allowed_commands(config.allowed_commands.clone())
    }

    /// Replace the launcher allow-list.
    pub fn with_allowed_commands(mut self, commands: Vec<String>) -> Self {
        self.allowed_commands = commands;
        self
    }

    /// Connect to every server in `configs`.
    ///
    /// A server that fails to launch, is not allowed, or fails its handshake
    /// is reported in [`ConnectReport::failed`] and skipped. Reconnecting a
    /// name that is already connected replaces the old connection.
    pub async fn connect(&self, configs: &[McpServerConfig]) -> ConnectReport {
        let mut report = ConnectReport::default();

        for config in configs {
            let opened = tokio::time::timeout(
                self.connect_timeout,
                McpConnection::open(config, &self.allowed_commands),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Connection {
                    server: config.name.clone(),
                    reason: format!(
                        "handshake timed out after {}s",
                        self.connect_timeout.as_secs()
                    ),
                })
            });

            match opened {
                Ok(conn) => {
                    let tool_count = conn.tools.len();
                    info!(server = %config.name, tool_count, "mcp server connected");
                    if let Some(previous) = self.install(conn).await {
                        let _ = previous.transport.close().await;
                    }
                    report.connected.push((config.name.clone(), tool_count));
                }
                Err(e) => {
                    let e = match e {
                        e @ (ToolError::Connection { .. } | ToolError::CommandNotAllowed { .. }) => e,
                        other => ToolError::Connection {
                            server: config.name.clone(),
                            reason: other.to_string(),
                        },
                    };
                    warn!(server = %config.name, error = %e, "mcp server connection failed");
                    report.failed.push((config.name.clone(), e));
                }
            }
        }
        report
    }

    async fn install(&self, conn: McpConnection) -> Option<Arc<McpConnection>> {
        let mut state = self.state.write().await;
        let name = conn.name.clone();
        state.routes.retain(|_, (server, _)| server != &name);
        for tool in &conn.tools {
            state.routes.insert(
                qualified_name(&name, &tool.name),
                (name.clone(), tool.name.clone()),
            );
        }
        state.connections.insert(name, Arc::new(conn))
    }

    /// Tool catalog of every connected server, with qualified names.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let state = self.state.read().await;
        let mut defs: Vec<ToolDefinition> = state
            .connections
            .values()
            .flat_map(|conn| {
                conn.tools.iter().map(|tool| {
                    ToolDefinition::new(
                        qualified_name(&conn.name, &tool.name),
                        format!("[MCP:{}] {}", conn.name, tool.description),
                        tool.input_schema.clone(),
                    )
                })
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Whether `qualified_name` routes to a connected server.
    pub async fn has_tool(&self, qualified_name: &str) -> bool {
        self.state.read().await.routes.contains_key(qualified_name)
    }

    /// Names of connected servers, sorted.
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Raw tool list of one server, or `None` if it is not connected.
    pub async fn server_tools(&self, server: &str) -> Option<Vec<McpToolDefinition>> {
        self.state
            .read()
            .await
            .connections
            .get(server)
            .map(|conn| conn.tools.clone())
    }

    /// Invoke a tool and fold every failure into a failed [`ToolResult`].
    pub async fn call_tool(
        &self,
        tool_call_id: &str,
        qualified_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> ToolResult {
        match self.try_call_tool(qualified_name, arguments, timeout).await {
            Ok(text) => ToolResult::ok(tool_call_id, text),
            Err(e) => {
                warn!(tool = qualified_name, error = %e, "mcp tool call failed");
                ToolResult::from_error(tool_call_id, &e)
            }
        }
    }

    /// Invoke a tool, returning its text output.
    pub async fn try_call_tool(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String> {
        let (conn, tool) = {
            let state = self.state.read().await;
            let (server, tool) =
                state
                    .routes
                    .get(qualified_name)
                    .ok_or_else(|| ToolError::NotFound {
                        tool_name: qualified_name.to_owned(),
                    })?;
            let conn = state
                .connections
                .get(server)
                .cloned()
                .ok_or_else(|| ToolError::NotFound {
                    tool_name: qualified_name.to_owned(),
                })?;
            (conn, tool.clone())
        };

        debug!(server = %conn.name, tool = %tool, "calling mcp tool");
        let params = json!({"name": tool, "arguments": arguments});
        let raw = tokio::time::timeout(timeout, conn.call("tools/call", Some(params)))
            .await
            .map_err(|_| ToolError::Timeout {
                tool_name: qualified_name.to_owned(),
                millis: timeout.as_millis(),
            })??;

        let result: McpToolResult =
            serde_json::from_value(raw).map_err(|e| ToolError::Protocol {
                server: conn.name.clone(),
                reason: format!("invalid tools/call result: {e}"),
            })?;

        if result.is_error() {
            return Err(ToolError::ExecutionFailed {
                tool_name: qualified_name.to_owned(),
                reason: result.text(),
            });
        }
        Ok(result.text())
    }

    /// Close every transport and forget all tools. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let connections = {
            let mut state = self.state.write().await;
            state.routes.clear();
            std::mem::take(&mut state.connections)
        };
        for (name, conn) in connections {
            if let Err(e) = conn.transport.close().await {
                warn!(server = %name, error = %e, "error while closing mcp server");
            }
        }
    }
}
