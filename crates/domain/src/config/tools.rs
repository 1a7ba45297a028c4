use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool availability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Built-in tool names enabled for dispatch. Empty = all registered.
    #[serde(default)]
    pub builtin_enabled: Vec<String>,
}

/// MCP servers keyed by server name; tools resolve as `server@tool`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
}

/// A2A services; tools resolve from the `a2a@` name prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aConfig {
    #[serde(default)]
    pub services: HashMap<String, A2aServiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aServiceConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Knowledge base names exposed as query tools.
    #[serde(default)]
    pub bases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories scanned for `<skill>/SKILL.md`.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Enabled skill names. Empty = all discovered.
    #[serde(default)]
    pub enabled: Vec<String>,
}
