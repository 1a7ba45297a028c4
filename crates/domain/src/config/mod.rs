//! Typed configuration recognized by the engine.
//!
//! Loading, admin CRUD, and validation policy live outside the core; the
//! engine consumes a fully-formed [`RelayConfig`] (usually deserialized
//! from TOML) plus optional per-request sparse overrides applied with
//! [`RelayConfig::with_overrides`].

mod llm;
mod observability;
mod sandbox;
mod security;
mod server;
mod tools;
mod workspace;

pub use llm::{HistoryCompactionReset, LlmConfig, LlmModelConfig};
pub use observability::ObservabilityConfig;
pub use sandbox::{SandboxConfig, SandboxMode};
pub use security::SecurityConfig;
pub use server::ServerConfig;
pub use tools::{A2aConfig, KnowledgeConfig, McpConfig, SkillsConfig, ToolsConfig};
pub use workspace::WorkspaceConfig;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub a2a: A2aConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolve the LLM config for a request: named model, else default.
    pub fn resolve_model(&self, model_name: Option<&str>) -> Result<LlmModelConfig> {
        self.llm.resolve(model_name)
    }

    /// Apply a sparse deep-merge of JSON overrides over this config.
    /// Unknown keys are rejected by deserialization of the merged value.
    pub fn with_overrides(&self, overrides: Option<&serde_json::Value>) -> Result<Self> {
        let Some(overrides) = overrides else {
            return Ok(self.clone());
        };
        if overrides.as_object().map_or(true, |o| o.is_empty()) {
            return Ok(self.clone());
        }
        let mut base = serde_json::to_value(self)?;
        deep_merge(&mut base, overrides);
        serde_json::from_value(base).map_err(|e| Error::Config(format!("bad overrides: {e}")))
    }
}

/// Recursively merge `patch` into `base`. Objects merge key-wise; any
/// non-object value replaces the base value.
fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}
