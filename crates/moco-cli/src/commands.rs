//! Subcommand implementations.

use std::path::Path;

use anyhow::{Context, Result, bail};
use moco_agent::{AgentRegistry, GuardrailAction, GuardrailPipeline, GuardrailResult, MocoConfig};
use moco_store::CheckpointStore;
use moco_tools::McpClient;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::{CheckpointAction, McpAction};

pub fn load_config(path: &Path) -> Result<MocoConfig> {
    let config = MocoConfig::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(path = %path.display(), exists = path.exists(), "configuration loaded");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Guardrails
// ---------------------------------------------------------------------------

pub fn check_input(config: &MocoConfig, text: &str) -> Result<()> {
    let pipeline =
        GuardrailPipeline::new(&config.guardrails).context("invalid guardrail configuration")?;
    report(&pipeline.validate_input(text))
}

pub fn check_tool(config: &MocoConfig, name: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be JSON")?;
    let pipeline =
        GuardrailPipeline::new(&config.guardrails).context("invalid guardrail configuration")?;
    report(&pipeline.validate_tool_call(name, &args, 0))
}

/// Print the verdict; a block is a failing exit.
fn report(result: &GuardrailResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if result.action == GuardrailAction::Block {
        bail!("blocked: {}", result.message);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

pub async fn checkpoints(config: &MocoConfig, action: CheckpointAction) -> Result<()> {
    let store = CheckpointStore::open(&config.checkpoint)
        .await
        .with_context(|| {
            format!(
                "failed to open checkpoints in {}",
                config.checkpoint.data_dir.display()
            )
        })?;

    match action {
        CheckpointAction::List { session } => {
            let checkpoints = store.list(&session).await?;
            if checkpoints.is_empty() {
                println!("no checkpoints for {session}");
            }
            for cp in checkpoints {
                println!(
                    "{}  {}  turns={}  messages={}  {}",
                    cp.id,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    cp.turn_count().unwrap_or_default(),
                    cp.messages.len(),
                    cp.summary
                );
            }
        }
        CheckpointAction::Show { id } => {
            let cp = store
                .load(&id)
                .await
                .with_context(|| format!("checkpoint {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&cp)?);
        }
        CheckpointAction::Delete { id } => {
            store
                .delete(&id)
                .await
                .with_context(|| format!("failed to delete checkpoint {id}"))?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MCP
// ---------------------------------------------------------------------------

pub async fn mcp(config: &MocoConfig, action: McpAction) -> Result<()> {
    match action {
        McpAction::Tools => {
            if config.mcp.servers.is_empty() {
                println!("no MCP servers configured");
                return Ok(());
            }
            let client = McpClient::from_config(&config.mcp);
            let report = client.connect(&config.mcp.servers).await;
            for (server, error) in &report.failed {
                warn!(server = %server, error = %error, "MCP server unavailable");
                println!("{server}: failed ({error})");
            }
            for tool in client.tool_definitions().await {
                println!("{}\t{}", tool.name, tool.description);
            }
            client.disconnect().await;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub fn agents(config: &MocoConfig) -> Result<()> {
    let Some(dir) = &config.agents_dir else {
        println!("no agents_dir configured; the built-in orchestrator is used");
        return Ok(());
    };
    let registry = AgentRegistry::load_dir(dir)
        .with_context(|| format!("failed to load agents from {}", dir.display()))?;
    let default = registry
        .default_agent(config.default_agent.as_deref())
        .map(|a| a.name.clone());

    for agent in registry.definitions() {
        let marker = if default.as_deref() == Some(agent.name.as_str()) {
            "*"
        } else {
            " "
        };
        let tools = if agent.tools.is_empty() {
            "all tools".to_owned()
        } else {
            agent.tools.join(", ")
        };
        println!(
            "{marker} {:<20} {:<9} delegate={:<5} {tools}\n    {}",
            agent.name,
            format!("{:?}", agent.mode).to_lowercase(),
            agent.can_delegate,
            agent.description
        );
    }
    Ok(())
}
