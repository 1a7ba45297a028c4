use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Named model configs; a request's `model_name` selects one.
    #[serde(default)]
    pub models: HashMap<String, LlmModelConfig>,
    /// Model used when the request names none.
    #[serde(default)]
    pub default_model: String,
}

impl LlmConfig {
    pub fn resolve(&self, model_name: Option<&str>) -> Result<LlmModelConfig> {
        let name = match model_name {
            Some(name) if !name.is_empty() => name,
            _ => self.default_model.as_str(),
        };
        if name.is_empty() {
            if let Some(config) = self.models.values().next() {
                return Ok(config.clone());
            }
            return Ok(LlmModelConfig::default());
        }
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown model: {name}")))
    }
}

/// Per-model knobs that drive the loop and compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelConfig {
    /// Upstream model identifier passed through to the wire client.
    #[serde(default)]
    pub model: String,
    #[serde(default = "d_max_context")]
    pub max_context: u64,
    #[serde(default = "d_max_output")]
    pub max_output: u64,
    #[serde(default = "d_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f64,
    #[serde(default = "d_timeout")]
    pub timeout_s: u64,
    /// Stream-retry attempts for incomplete streams.
    #[serde(default = "d_retry")]
    pub retry: u32,
    #[serde(default = "d_true")]
    pub stream: bool,
    /// Cumulative-history trigger as a fraction of `max_context`.
    #[serde(default = "d_history_ratio")]
    pub history_compaction_ratio: f64,
    #[serde(default)]
    pub history_compaction_reset: HistoryCompactionReset,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for LlmModelConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_context: d_max_context(),
            max_output: d_max_output(),
            max_rounds: d_max_rounds(),
            temperature: d_temperature(),
            timeout_s: d_timeout(),
            retry: d_retry(),
            stream: true,
            history_compaction_ratio: d_history_ratio(),
            history_compaction_reset: HistoryCompactionReset::default(),
            stop: Vec::new(),
        }
    }
}

/// What happens to the cumulative history counter after a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryCompactionReset {
    /// Reset the counter to zero.
    #[default]
    Zero,
    /// Reset to the token estimate of the rebuilt context.
    Current,
    /// Leave the counter untouched.
    Keep,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_context() -> u64 {
    32_768
}
fn d_max_output() -> u64 {
    4096
}
fn d_max_rounds() -> u32 {
    10
}
fn d_temperature() -> f64 {
    0.7
}
fn d_timeout() -> u64 {
    60
}
fn d_retry() -> u32 {
    2
}
fn d_true() -> bool {
    true
}
fn d_history_ratio() -> f64 {
    crate::constants::COMPACTION_HISTORY_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_named_model() {
        let mut config = LlmConfig::default();
        config.models.insert(
            "fast".into(),
            LlmModelConfig {
                max_rounds: 2,
                ..Default::default()
            },
        );
        config.default_model = "fast".into();
        assert_eq!(config.resolve(Some("fast")).unwrap().max_rounds, 2);
        assert_eq!(config.resolve(None).unwrap().max_rounds, 2);
        assert!(config.resolve(Some("missing")).is_err());
    }

    #[test]
    fn resolve_without_models_yields_defaults() {
        let config = LlmConfig::default();
        let model = config.resolve(None).unwrap();
        assert_eq!(model.max_rounds, 10);
        assert_eq!(model.timeout_s, 60);
    }

    #[test]
    fn reset_policy_parses_lowercase() {
        let parsed: HistoryCompactionReset = serde_json::from_str("\"current\"").unwrap();
        assert_eq!(parsed, HistoryCompactionReset::Current);
    }
}
