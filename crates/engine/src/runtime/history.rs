//! Conversation history loading across compaction boundaries, plus the
//! synthesized artifact index.
//!
//! Filtering rule: system rows never re-enter the context; rows covered
//! by the newest compaction summary (timestamp ≤ `compacted_until_ts`,
//! falling back to row position when timestamps are missing) are dropped;
//! the summary itself and the artifact index are prepended as system
//! messages.

use std::collections::HashMap;
use std::str::FromStr;

use relay_domain::chat::{ArtifactRecord, ChatRecord, ContentPart, Message, MessageContent, Role};
use relay_domain::config::LlmModelConfig;
use relay_domain::constants::{
    ARTIFACT_INDEX_LIST_LIMIT, ARTIFACT_INDEX_MAX_ITEMS, ARTIFACT_INDEX_PREFIX,
    COMPACTION_META_TYPE, COMPACTION_OUTPUT_RESERVE, COMPACTION_RATIO, COMPACTION_SAFETY_MARGIN,
    COMPACTION_SUMMARY_PREFIX,
};
use relay_domain::Result;

use crate::workspace::WorkspaceManager;

/// Result of splitting history at the newest compaction summary.
pub struct FilteredHistory {
    /// Rows that remain live context, in order.
    pub items: Vec<ChatRecord>,
    /// The newest compaction-summary row, if any.
    pub summary: Option<ChatRecord>,
}

/// Prefix a compaction summary so later loads can recognize it.
pub fn format_compaction_summary(summary: &str) -> String {
    let cleaned = summary.trim();
    let cleaned = if cleaned.is_empty() {
        "no summary available"
    } else {
        cleaned
    };
    if cleaned.starts_with(COMPACTION_SUMMARY_PREFIX) {
        cleaned.to_string()
    } else {
        format!("{COMPACTION_SUMMARY_PREFIX}\n{cleaned}")
    }
}

/// Prefix an artifact index block; empty content stays empty.
pub fn format_artifact_index(content: &str) -> String {
    let cleaned = content.trim();
    if cleaned.is_empty() {
        return String::new();
    }
    if cleaned.starts_with(ARTIFACT_INDEX_PREFIX) {
        cleaned.to_string()
    } else {
        format!("{ARTIFACT_INDEX_PREFIX}\n{cleaned}")
    }
}

/// Whether a chat row is a compaction summary (by meta type, or by the
/// marker prefix for rows written before meta existed).
pub fn is_compaction_summary(record: &ChatRecord) -> bool {
    if record.meta_type() == Some(COMPACTION_META_TYPE) {
        return true;
    }
    record
        .content
        .as_str()
        .map(|content| content.starts_with(COMPACTION_SUMMARY_PREFIX))
        .unwrap_or(false)
}

/// The effective context limit: `max_context × COMPACTION_RATIO`, capped
/// by `max_context − reserve_output − safety_margin`.
pub fn get_auto_compact_limit(model: &LlmModelConfig) -> Option<u64> {
    if model.max_context == 0 {
        return None;
    }
    let ratio_limit = (model.max_context as f64 * COMPACTION_RATIO) as u64;
    let reserve_output = if model.max_output > 0 {
        model.max_output
    } else {
        COMPACTION_OUTPUT_RESERVE
    };
    let hard_limit = model
        .max_context
        .saturating_sub(reserve_output)
        .saturating_sub(COMPACTION_SAFETY_MARGIN);
    if hard_limit == 0 {
        return Some(ratio_limit.min(model.max_context).max(1));
    }
    Some(ratio_limit.min(hard_limit).max(1))
}

fn extract_compacted_until_ts(record: &ChatRecord) -> Option<f64> {
    let meta = record.meta.as_ref()?;
    if let Some(ts) = meta.get("compacted_until_ts").and_then(|v| v.as_f64()) {
        if ts > 0.0 {
            return Some(ts);
        }
    }
    let raw = meta.get("compacted_until")?.as_str()?;
    chrono::DateTime::<chrono::Utc>::from_str(raw)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

/// Split history at the newest compaction summary: drop system rows, the
/// summary rows themselves, and everything the summary covers.
pub fn filter_history_items(history: &[ChatRecord]) -> FilteredHistory {
    let mut summary_index: Option<usize> = None;
    for (index, record) in history.iter().enumerate() {
        if is_compaction_summary(record) {
            summary_index = Some(index);
        }
    }
    let summary = summary_index.map(|index| history[index].clone());
    let compacted_until_ts = summary.as_ref().and_then(extract_compacted_until_ts);

    let mut items = Vec::new();
    for (index, record) in history.iter().enumerate() {
        if is_compaction_summary(record) || record.role == "system" {
            continue;
        }
        match compacted_until_ts {
            Some(cutoff) => {
                if record.timestamp > 0.0 {
                    if record.timestamp <= cutoff {
                        continue;
                    }
                } else if summary_index.map_or(false, |si| index <= si) {
                    // No timestamp: fall back to position relative to the
                    // summary row.
                    continue;
                }
            }
            None => {
                if summary_index.map_or(false, |si| index <= si) {
                    continue;
                }
            }
        }
        items.push(record.clone());
    }
    FilteredHistory { items, summary }
}

/// Convert one chat row into a context message. Tool rows re-enter as
/// observations; assistant rows keep their reasoning trace.
pub fn build_message_from_record(record: &ChatRecord) -> Option<Message> {
    let role = Role::from_str(&record.role).ok()?;
    if record.content.is_null() {
        return None;
    }
    if role == Role::Tool {
        let text = match record.content.as_str() {
            Some(text) => text.to_string(),
            None => record.content.to_string(),
        };
        return Some(Message::observation(text));
    }
    let content = value_to_content(&record.content);
    let reasoning_content = match role {
        Role::Assistant => record
            .reasoning_content
            .clone()
            .filter(|r| !r.is_empty()),
        _ => None,
    };
    Some(Message {
        role,
        content,
        reasoning_content,
    })
}

fn value_to_content(value: &serde_json::Value) -> MessageContent {
    if let Some(text) = value.as_str() {
        return MessageContent::Text(text.to_string());
    }
    if value.is_array() {
        if let Ok(parts) = serde_json::from_value::<Vec<ContentPart>>(value.clone()) {
            return MessageContent::Parts(parts);
        }
    }
    MessageContent::Text(value.to_string())
}

/// Load the context for a session: latest summary (if any), artifact
/// index (if any), then the live history converted to messages.
pub async fn load_history_messages(
    workspace: &WorkspaceManager,
    user_id: &str,
    session_id: &str,
    max_items: usize,
) -> Result<Vec<Message>> {
    let history = workspace.load_history(user_id, session_id, max_items).await?;
    let filtered = filter_history_items(&history);

    let mut messages = Vec::new();
    if let Some(summary) = &filtered.summary {
        let text = summary
            .content
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| summary.content.to_string());
        messages.push(Message::system(format_compaction_summary(&text)));
    }

    let artifact_block = load_artifact_index_message(workspace, user_id, session_id).await?;
    if !artifact_block.is_empty() {
        messages.push(Message::system(artifact_block));
    }

    for record in &filtered.items {
        if let Some(message) = build_message_from_record(record) {
            messages.push(message);
        }
    }
    Ok(messages)
}

/// Live history rows eligible for compaction, paired with their message
/// form (same order, same length).
pub fn build_compaction_candidates(history: &[ChatRecord]) -> (Vec<ChatRecord>, Vec<Message>) {
    let filtered = filter_history_items(history);
    let mut items = Vec::new();
    let mut messages = Vec::new();
    for record in filtered.items {
        if let Some(message) = build_message_from_record(&record) {
            items.push(record);
            messages.push(message);
        }
    }
    (items, messages)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn load_artifact_index_message(
    workspace: &WorkspaceManager,
    user_id: &str,
    session_id: &str,
) -> Result<String> {
    let artifacts = workspace
        .load_artifact_logs(user_id, session_id, ARTIFACT_INDEX_MAX_ITEMS)
        .await?;
    Ok(format_artifact_index(&build_artifact_index_text(&artifacts)))
}

fn unique_in_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

fn format_index_items(items: &[String], limit: usize) -> String {
    let total = items.len();
    let shown = items.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if total > limit {
        format!("{shown} …and {total} items")
    } else {
        shown
    }
}

/// Aggregate artifact rows into the five index categories: file reads,
/// file changes (merged by path), command executions, script runs, and
/// failures. Each category dedups in order and truncates with a count.
pub fn build_artifact_index_text(artifacts: &[ArtifactRecord]) -> String {
    if artifacts.is_empty() {
        return String::new();
    }
    let mut file_reads = Vec::new();
    let mut file_changes: Vec<(String, Vec<String>)> = Vec::new();
    let mut change_index: HashMap<String, usize> = HashMap::new();
    let mut commands = Vec::new();
    let mut scripts = Vec::new();
    let mut failures = Vec::new();

    for entry in artifacts {
        let name = entry.name.trim();
        let error = entry.error.as_deref().unwrap_or("").trim();
        if !error.is_empty() || !entry.ok {
            let label = if !name.is_empty() {
                name
            } else if !entry.tool.is_empty() {
                entry.tool.as_str()
            } else {
                "unknown entry"
            };
            let reason = if error.is_empty() { "failed" } else { error };
            failures.push(format!("{label}: {reason}"));
        }
        if name.is_empty() {
            continue;
        }
        match entry.kind.as_str() {
            "file" => {
                if entry.action == "read" {
                    file_reads.push(name.to_string());
                } else {
                    let action = if entry.action.is_empty() {
                        "changed".to_string()
                    } else {
                        entry.action.clone()
                    };
                    match change_index.get(name) {
                        Some(&slot) => {
                            let actions = &mut file_changes[slot].1;
                            if !actions.contains(&action) {
                                actions.push(action);
                            }
                        }
                        None => {
                            change_index.insert(name.to_string(), file_changes.len());
                            file_changes.push((name.to_string(), vec![action]));
                        }
                    }
                }
            }
            "command" => commands.push(format_run_entry(name, entry)),
            "script" => scripts.push(format_run_entry(name, entry)),
            _ => {}
        }
    }

    let file_reads = unique_in_order(file_reads);
    let commands = unique_in_order(commands);
    let scripts = unique_in_order(scripts);
    let failures = unique_in_order(failures);
    let file_change_items = unique_in_order(
        file_changes
            .into_iter()
            .map(|(path, actions)| format!("{path}({})", actions.join("/")))
            .collect(),
    );

    let mut lines = vec![ARTIFACT_INDEX_PREFIX.to_string()];
    for (label, items) in [
        ("file reads", &file_reads),
        ("file changes", &file_change_items),
        ("commands", &commands),
        ("scripts", &scripts),
        ("failures", &failures),
    ] {
        if !items.is_empty() {
            lines.push(format!(
                "- {label}({}): {}",
                items.len(),
                format_index_items(items, ARTIFACT_INDEX_LIST_LIMIT)
            ));
        }
    }
    if lines.len() == 1 {
        return String::new();
    }
    lines.join("\n")
}

fn format_run_entry(name: &str, entry: &ArtifactRecord) -> String {
    match entry.meta.get("returncode").and_then(|v| v.as_i64()) {
        Some(code) => format!("{name}(rc={code})"),
        None => name.to_string(),
    }
}
