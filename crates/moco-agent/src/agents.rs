//! Agent definitions and the registry that holds them.
//!
//! Definitions are plain TOML files, one agent per file:
//!
//! ```toml
//! name = "coder"            # optional, defaults to the file stem
//! description = "Writes and edits code"
//! mode = "subagent"         # or "primary" (default)
//! tools = ["execute_bash"]  # empty or ["*"] means every tool
//! can_delegate = false
//! system_prompt = """
//! You are a careful programmer.
//! """
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Name of the built-in delegation tool.
pub const DELEGATE_TOOL_NAME: &str = "delegate_to_agent";

/// Name of the agent whose replies are not prefixed.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Can own a session.
    #[default]
    Primary,
    /// Only reachable through delegation.
    Subagent,
}

/// A named persona: system prompt plus tool permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub can_delegate: bool,
    #[serde(default)]
    pub mode: AgentMode,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            can_delegate: false,
            mode: AgentMode::Primary,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delegation(mut self) -> Self {
        self.can_delegate = true;
        self
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse one definition, taking the name from `fallback_name` when the
    /// file does not set one.
    pub fn from_toml(content: &str, fallback_name: &str) -> Result<Self> {
        let mut def: Self = toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid agent definition `{fallback_name}`: {e}"),
        })?;
        if def.name.trim().is_empty() {
            def.name = fallback_name.to_owned();
        }
        def.normalize();
        Ok(def)
    }

    /// The orchestrator, and any agent listing the delegation tool, may
    /// delegate. The delegation tool itself never stays in `tools`.
    fn normalize(&mut self) {
        if self.name == ORCHESTRATOR_AGENT || self.tools.iter().any(|t| t == DELEGATE_TOOL_NAME) {
            self.can_delegate = true;
        }
        self.tools.retain(|t| t != DELEGATE_TOOL_NAME);
    }

    /// Whether this agent may call `tool`.
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == "*" || t == tool)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable set of agent definitions. Reloading builds a new registry.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<AgentDefinition>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, replacing one with the same name.
    pub fn insert(&mut self, mut definition: AgentDefinition) {
        definition.normalize();
        self.agents
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn with_agent(mut self, definition: AgentDefinition) -> Self {
        self.insert(definition);
        self
    }

    /// Load every `*.toml` file in `dir`. Unparsable files fail the load so
    /// a broken reload never replaces a working registry.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        let entries = std::fs::read_dir(dir).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot read agents directory {}: {e}", dir.display()),
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        for path in paths {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_owned();
            let content = std::fs::read_to_string(&path)?;
            let def = AgentDefinition::from_toml(&content, &stem)?;
            if registry.agents.contains_key(&def.name) {
                warn!(agent = %def.name, path = %path.display(), "duplicate agent name, later file wins");
            }
            debug!(agent = %def.name, path = %path.display(), "agent definition loaded");
            registry.insert(def);
        }

        info!(dir = %dir.display(), count = registry.len(), "agent definitions loaded");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Agent names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<AgentDefinition>> {
        self.agents.values()
    }

    /// Pick the agent that owns a new session: `preferred` if registered,
    /// otherwise the orchestrator, otherwise the first primary agent.
    pub fn default_agent(&self, preferred: Option<&str>) -> Option<Arc<AgentDefinition>> {
        preferred
            .and_then(|name| self.get(name))
            .or_else(|| self.get(ORCHESTRATOR_AGENT))
            .or_else(|| {
                self.agents
                    .values()
                    .find(|a| a.mode == AgentMode::Primary)
                    .cloned()
            })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_definition_and_defaults_name() {
        let def = AgentDefinition::from_toml(
            r#"
            description = "Writes code"
            mode = "subagent"
            tools = ["execute_bash", "delegate_to_agent"]
            system_prompt = "You write code."
            "#,
            "coder",
        )
        .unwrap();
        assert_eq!(def.name, "coder");
        assert_eq!(def.mode, AgentMode::Subagent);
        assert!(def.can_delegate);
        assert_eq!(def.tools, vec!["execute_bash".to_owned()]);
    }

    #[test]
    fn orchestrator_can_always_delegate() {
        let reg = AgentRegistry::new().with_agent(AgentDefinition::new(ORCHESTRATOR_AGENT, "route"));
        assert!(reg.get(ORCHESTRATOR_AGENT).unwrap().can_delegate);
    }

    #[test]
    fn tool_permissions() {
        let all = AgentDefinition::new("a", "p");
        assert!(all.allows_tool("anything"));
        let star = AgentDefinition::new("b", "p").with_tools(["*"]);
        assert!(star.allows_tool("anything"));
        let some = AgentDefinition::new("c", "p").with_tools(["read_file"]);
        assert!(some.allows_tool("read_file"));
        assert!(!some.allows_tool("execute_bash"));
    }

    #[test]
    fn load_dir_reads_toml_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orchestrator.toml"),
            "system_prompt = \"route work\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("reviewer.toml"),
            "name = \"code-reviewer\"\nmode = \"subagent\"\nsystem_prompt = \"review\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let reg = AgentRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(reg.names(), vec!["code-reviewer", "orchestrator"]);
        assert_eq!(reg.default_agent(None).unwrap().name, "orchestrator");
        assert_eq!(
            reg.default_agent(Some("code-reviewer")).unwrap().name,
            "code-reviewer"
        );
    }

    #[test]
    fn broken_file_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.toml"), "system_prompt = [").unwrap();
        assert!(AgentRegistry::load_dir(dir.path()).is_err());
        assert!(AgentRegistry::load_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn default_agent_falls_back_to_first_primary() {
        let reg = AgentRegistry::new()
            .with_agent(AgentDefinition::new("helper", "h").with_mode(AgentMode::Subagent))
            .with_agent(AgentDefinition::new("writer", "w"));
        assert_eq!(reg.default_agent(Some("nope")).unwrap().name, "writer");
        assert!(AgentRegistry::new().default_agent(None).is_none());
    }
}
