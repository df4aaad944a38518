//! Tool execution for moco: local tools, the MCP client, and the gateway
//! that puts both behind one name-based surface.
//!
//! ## Modules
//!
//! - [`types`] -- Tool definitions and results.
//! - [`tool`] -- The [`Tool`] trait, argument validation, output truncation.
//! - [`shell`] -- The built-in `execute_bash` tool.
//! - [`mcp`] -- JSON-RPC client for external MCP servers.
//! - [`gateway`] -- [`ToolGateway`], routing calls to local or MCP tools.
//! - [`error`] -- Tool error types.

pub mod error;
pub mod gateway;
pub mod mcp;
pub mod shell;
pub mod tool;
pub mod types;

pub use error::{Result, ToolError};
pub use gateway::ToolGateway;
pub use mcp::{ConnectReport, McpClient, McpConfig, McpServerConfig, McpTransportConfig};
pub use shell::{SHELL_TOOL_NAME, ShellTool};
pub use tool::{MAX_TOOL_OUTPUT_CHARS, Tool, truncate_tool_output, validate_arguments};
pub use types::{ToolDefinition, ToolErrorKind, ToolResult};
