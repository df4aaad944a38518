//! MCP (Model Context Protocol) client.
//!
//! Discovers and invokes tools hosted by external servers. Each configured
//! server is reached over a [`Transport`]: a subprocess speaking JSON-RPC on
//! stdio, or an HTTP endpoint. Tools are exposed as `{server}__{tool}`.

pub mod client;
pub mod protocol;
pub mod transport;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use client::{ConnectReport, McpClient, qualified_name};
pub use protocol::{McpToolDefinition, McpToolResult};
pub use transport::{HttpTransport, StdioTransport, Transport};

/// Launchers that stdio servers may be started with.
pub const ALLOWED_COMMANDS: &[&str] = &["npx", "node", "python", "python3", "uvx", "deno"];

/// Separator between server and tool in a qualified tool name.
pub const NAME_SEPARATOR: &str = "__";

/// The `[mcp]` configuration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
    /// Limit on the initialize handshake and tool listing, per server.
    pub connect_timeout_secs: u64,
    /// Default limit for a single `tools/call`.
    pub call_timeout_secs: u64,
    /// Launchers stdio servers may use.
    pub allowed_commands: Vec<String>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connect_timeout_secs: 30,
            call_timeout_secs: 30,
            allowed_commands: ALLOWED_COMMANDS.iter().map(|c| (*c).to_owned()).collect(),
        }
    }
}

/// One `[[mcp.servers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
}

/// How to reach a server: `{command, args, env}` or `{url}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportConfig::Http { url: url.into() },
        }
    }
}

/// Whether `command` (a bare name or a path) is one of `allowed`.
pub fn is_allowed_command(command: &str, allowed: &[String]) -> bool {
    let program = std::path::Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);
    allowed.iter().any(|a| a == program)
}
