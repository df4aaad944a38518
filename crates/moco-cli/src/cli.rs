//! CLI argument definitions for moco.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// moco -- multi-agent orchestration runtime.
#[derive(Parser)]
#[command(
    name = "moco",
    version,
    about = "moco -- multi-agent orchestration runtime",
    long_about = "Operational commands for a moco deployment: dry-run the guardrails, \
                  inspect checkpoints, discover MCP tools and list agents."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = moco_agent::CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a user message through the input guardrails.
    CheckInput {
        text: String,
    },

    /// Run a tool call through the tool guardrails.
    CheckTool {
        name: String,

        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Inspect saved checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// MCP server operations.
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },

    /// List the configured agents.
    Agents,
}

#[derive(Subcommand)]
pub enum CheckpointAction {
    /// List a session's checkpoints, newest first.
    List { session: String },
    /// Print one checkpoint as JSON.
    Show { id: String },
    /// Delete one checkpoint.
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum McpAction {
    /// Connect to every configured server and list its tools.
    Tools,
}
