//! System prompt assembly with fingerprint-keyed LRU caching.
//!
//! The prompt is deterministic in its inputs; the cache key captures
//! every input that can change it (config version, workspace tree
//! version, overrides, tool set, tool-store versions), so a stale entry
//! can only be served while nothing observable moved.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use relay_domain::chat::ToolSpec;
use relay_skills::SkillSpec;

use crate::prompts::{PromptTemplates, BASE_SYSTEM_FALLBACK};

const PROMPT_CACHE_CAPACITY: usize = 128;
const PROMPT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Everything that feeds the system prompt for one request.
pub struct PromptInputs<'a> {
    pub user_id: &'a str,
    pub config_version: u64,
    pub workspace_tree_version: u64,
    pub workdir: &'a str,
    /// Canonical JSON of the request's config overrides (empty = none).
    pub overrides_canonical: &'a str,
    pub allowed_tools: &'a [String],
    pub user_tool_version: u64,
    pub shared_tool_version: u64,
    /// Specs for the allowed tools, already filtered.
    pub tool_specs: &'a [ToolSpec],
    pub skills: &'a [&'a SkillSpec],
    pub workspace_tree: &'a str,
    pub user_extra_prompt: Option<&'a str>,
}

struct CachedPrompt {
    text: String,
    built_at: Instant,
}

pub struct PromptComposer {
    templates: Arc<PromptTemplates>,
    cache: Mutex<LruCache<String, CachedPrompt>>,
}

impl PromptComposer {
    pub fn new(templates: Arc<PromptTemplates>) -> Self {
        let capacity = NonZeroUsize::new(PROMPT_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            templates,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compose (or fetch) the system prompt for the given inputs.
    pub fn compose(&self, inputs: &PromptInputs<'_>) -> String {
        let key = cache_key(inputs);
        {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&key) {
                if cached.built_at.elapsed() < PROMPT_CACHE_TTL {
                    return cached.text.clone();
                }
                cache.pop(&key);
            }
        }
        let text = self.build(inputs);
        self.cache.lock().put(
            key,
            CachedPrompt {
                text: text.clone(),
                built_at: Instant::now(),
            },
        );
        text
    }

    fn build(&self, inputs: &PromptInputs<'_>) -> String {
        let mut blocks = Vec::new();

        blocks.push(self.templates.load("base_system", BASE_SYSTEM_FALLBACK));

        if !inputs.tool_specs.is_empty() {
            blocks.push(render_tool_protocol(inputs.tool_specs));
        }

        blocks.push(render_engineer_info(inputs.workdir, inputs.workspace_tree));

        if !inputs.skills.is_empty() {
            blocks.push(render_skill_block(inputs.skills));
        }

        if let Some(extra) = inputs.user_extra_prompt {
            if !extra.trim().is_empty() {
                blocks.push(extra.trim().to_string());
            }
        }

        blocks
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn cache_key(inputs: &PromptInputs<'_>) -> String {
    let mut tools: Vec<&str> = inputs.allowed_tools.iter().map(String::as_str).collect();
    tools.sort_unstable();
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        inputs.user_id,
        inputs.config_version,
        inputs.workspace_tree_version,
        inputs.workdir,
        inputs.overrides_canonical,
        tools.join(","),
        inputs.user_tool_version,
        inputs.shared_tool_version,
    )
}

fn render_tool_protocol(specs: &[ToolSpec]) -> String {
    let mut lines = vec![
        "## Tools".to_string(),
        "Invoke a tool by emitting exactly one block per call:".to_string(),
        r#"<tool_call>{"name": "<tool>", "arguments": { ... }}</tool_call>"#.to_string(),
        "Wait for the tool_response observation before continuing. Reply \
         without any tool_call block to finish."
            .to_string(),
        String::new(),
    ];
    for spec in specs {
        lines.push(format!("### {}", spec.name));
        if !spec.description.is_empty() {
            lines.push(spec.description.clone());
        }
        lines.push(format!(
            "args schema: {}",
            serde_json::to_string(&spec.args_schema).unwrap_or_else(|_| "{}".into())
        ));
        lines.push(String::new());
    }
    lines.join("\n")
}

fn render_engineer_info(workdir: &str, tree: &str) -> String {
    let mut lines = vec![
        "## Environment".to_string(),
        format!("OS: {}", std::env::consts::OS),
        format!("Date: {}", chrono::Utc::now().format("%Y-%m-%d")),
        format!("Workspace: {workdir}"),
    ];
    if !tree.trim().is_empty() {
        lines.push("Workspace tree (two levels):".to_string());
        lines.push(tree.trim_end().to_string());
    }
    lines.join("\n")
}

fn render_skill_block(skills: &[&SkillSpec]) -> String {
    let mut lines = vec![
        "## Skills".to_string(),
        "Usage protocol:".to_string(),
        "1. Check this list before starting any task.".to_string(),
        "2. Invoke a matching skill as a tool to load its document.".to_string(),
        "3. Follow the document's instructions exactly.".to_string(),
        "4. Read referenced resources from the skill's directory as needed.".to_string(),
        "5. Prefer a skill over improvising when both could work.".to_string(),
        "6. Report which skill you used in your answer.".to_string(),
        String::new(),
    ];
    for skill in skills {
        lines.push(format!("- {} ({})", skill.name, skill.path.display()));
        if !skill.frontmatter.trim().is_empty() {
            lines.push(skill.frontmatter.trim().to_string());
        }
    }
    lines.join("\n")
}
