//! Context compaction: when the token budget is breached (by estimate or
//! by the cumulative history counter), older messages are replaced with
//! an LLM-written summary plus the artifact index, keeping the most
//! recent interaction block verbatim.
//!
//! The summary row is persisted before the rebuilt message list is used,
//! so a crash between the two never loses the boundary.

use relay_domain::chat::{ChatRecord, Message, MessageContent, Role};
use relay_domain::config::{HistoryCompactionReset, LlmModelConfig};
use relay_domain::constants::{
    COMPACTION_HISTORY_RATIO, COMPACTION_KEEP_RECENT_TOKENS, COMPACTION_META_TYPE,
    COMPACTION_MIN_OBSERVATION_TOKENS, COMPACTION_SUMMARY_MAX_OUTPUT,
    COMPACTION_SUMMARY_MESSAGE_MAX_TOKENS,
};
use relay_domain::event::EventType;
use relay_domain::tokens::{
    approx_tokens, estimate_message, estimate_messages, trim_messages_to_budget,
    trim_text_to_tokens,
};
use relay_domain::Result;
use relay_providers::{CompletionRequest, LlmClient};
use relay_storage::now_ts;

use crate::prompts::{PromptTemplates, COMPACTION_FALLBACK};
use crate::workspace::WorkspaceManager;

use super::emitter::EventEmitter;
use super::history;

/// Everything the compaction pass needs from the request.
pub struct CompactContext<'a> {
    pub workspace: &'a WorkspaceManager,
    pub llm: &'a dyn LlmClient,
    pub templates: &'a PromptTemplates,
    pub model: &'a LlmModelConfig,
    pub max_history_items: usize,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub emitter: &'a EventEmitter,
}

/// Find the start of the tail block kept verbatim: the previous user →
/// assistant → user span walking backward from the end.
pub fn locate_tail_block_start(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    let Some(last_user) = messages.iter().rposition(|m| m.role == Role::User) else {
        return messages.len().saturating_sub(1);
    };
    let Some(assistant) = messages[..last_user]
        .iter()
        .rposition(|m| m.role == Role::Assistant)
    else {
        return last_user;
    };
    match messages[..assistant].iter().rposition(|m| m.role == Role::User) {
        Some(user) => user,
        None => assistant,
    }
}

/// Trim to a budget while keeping the tail block whole. The head is
/// dropped oldest-first; the tail survives even when it alone busts the
/// budget.
pub fn trim_messages_keep_tail(messages: &[Message], max_tokens: u64) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    if max_tokens == 0 {
        return vec![messages[messages.len() - 1].clone()];
    }
    let tail_start = locate_tail_block_start(messages).min(messages.len() - 1);
    let tail = &messages[tail_start..];
    let tail_tokens = estimate_messages(tail);
    if tail_tokens >= max_tokens {
        return tail.to_vec();
    }
    let mut kept = trim_messages_to_budget(&messages[..tail_start], max_tokens - tail_tokens);
    kept.extend(tail.iter().cloned());
    kept
}

/// Last-resort shrink: walk observation messages and trim each toward
/// the per-observation floor until the list fits.
pub fn shrink_messages_to_limit(messages: Vec<Message>, limit: u64) -> Vec<Message> {
    let mut total = estimate_messages(&messages);
    if total <= limit {
        return messages;
    }
    let mut overflow = total - limit;
    let mut trimmed = messages;
    for index in 0..trimmed.len() {
        if overflow == 0 {
            break;
        }
        if !trimmed[index].is_observation() {
            continue;
        }
        let MessageContent::Text(content) = &trimmed[index].content else {
            continue;
        };
        let current = approx_tokens(content);
        if current <= COMPACTION_MIN_OBSERVATION_TOKENS {
            continue;
        }
        let target = COMPACTION_MIN_OBSERVATION_TOKENS.max(current.saturating_sub(overflow));
        let new_content = trim_text_to_tokens(content, target, None);
        if new_content == *content {
            continue;
        }
        trimmed[index].content = MessageContent::Text(new_content);
        total = estimate_messages(&trimmed);
        overflow = total.saturating_sub(limit);
    }
    trimmed
}

/// Summarize-prompt hygiene: drop reasoning traces and cap each message.
pub fn prepare_summary_messages(messages: &[Message], max_message_tokens: u64) -> Vec<Message> {
    messages
        .iter()
        .map(|message| {
            let mut prepared = message.clone();
            prepared.reasoning_content = None;
            if let MessageContent::Text(text) = &prepared.content {
                if approx_tokens(text) > max_message_tokens {
                    prepared.content =
                        MessageContent::Text(trim_text_to_tokens(text, max_message_tokens, None));
                }
            }
            prepared
        })
        .collect()
}

fn normalize_ratio(raw: f64) -> f64 {
    if raw <= 0.0 {
        COMPACTION_HISTORY_RATIO
    } else if raw > 1.0 {
        // accept percentage-style input
        if raw <= 100.0 {
            raw / 100.0
        } else {
            1.0
        }
    } else {
        raw
    }
}

async fn apply_history_reset(
    ctx: &CompactContext<'_>,
    triggered_by_history: bool,
    reset: HistoryCompactionReset,
    current_tokens: u64,
) -> Result<bool> {
    if !triggered_by_history {
        return Ok(false);
    }
    match reset {
        HistoryCompactionReset::Keep => Ok(false),
        HistoryCompactionReset::Zero => {
            ctx.workspace
                .save_session_token_usage(ctx.user_id, ctx.session_id, 0)
                .await?;
            Ok(true)
        }
        HistoryCompactionReset::Current => {
            ctx.workspace
                .save_session_token_usage(ctx.user_id, ctx.session_id, current_tokens)
                .await?;
            Ok(true)
        }
    }
}

/// Run the compaction check and, when triggered, the full rebuild.
/// Always returns a usable message list; summary failures fall back to a
/// fixed string rather than aborting the request.
pub async fn maybe_compact(
    ctx: &CompactContext<'_>,
    messages: Vec<Message>,
) -> Result<Vec<Message>> {
    let Some(limit) = history::get_auto_compact_limit(ctx.model) else {
        return Ok(messages);
    };

    let history_usage = ctx
        .workspace
        .load_session_token_usage(ctx.user_id, ctx.session_id)
        .await
        .unwrap_or(0);
    let ratio = normalize_ratio(ctx.model.history_compaction_ratio);
    let history_threshold = (ctx.model.max_context as f64 * ratio) as u64;
    let triggered_by_history = history_threshold > 0 && history_usage >= history_threshold;

    let total_tokens = estimate_messages(&messages);
    if !triggered_by_history && total_tokens <= limit {
        return Ok(messages);
    }

    let reset = ctx.model.history_compaction_reset;
    let mut payload = serde_json::json!({
        "reason": if triggered_by_history { "history" } else { "overflow" },
        "history_usage": history_usage,
        "history_threshold": history_threshold,
        "limit": limit,
        "total_tokens": total_tokens,
    });

    ctx.emitter.emit(
        EventType::Progress,
        serde_json::json!({"stage": "compacting"}),
    );

    // Split off the base system prompt; summaries never re-summarize
    // system content.
    let system_message = messages
        .first()
        .filter(|m| m.role == Role::System)
        .cloned();
    let body = if system_message.is_some() {
        &messages[1..]
    } else {
        &messages[..]
    };
    let candidates: Vec<Message> = body
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    if candidates.is_empty() {
        apply_history_reset(ctx, triggered_by_history, reset, total_tokens).await?;
        payload["status"] = "skipped".into();
        payload["skip_reason"] = "no_candidates".into();
        ctx.emitter.emit(EventType::Compaction, payload);
        return Ok(messages);
    }

    let force = triggered_by_history && candidates.len() > 1;
    let keep_recent_tokens = COMPACTION_KEEP_RECENT_TOKENS.min((limit / 2).max(1));
    let mut recent = trim_messages_keep_tail(&candidates, keep_recent_tokens);
    if recent.len() >= candidates.len() && estimate_messages(&recent) <= keep_recent_tokens {
        if !force {
            apply_history_reset(ctx, triggered_by_history, reset, total_tokens).await?;
            payload["status"] = "skipped".into();
            payload["skip_reason"] = "keep_recent".into();
            ctx.emitter.emit(EventType::Compaction, payload);
            return Ok(messages);
        }
        // History trigger forces a rebuild; keep only the last message.
        recent = candidates[candidates.len() - 1..].to_vec();
        payload["forced"] = true.into();
    }
    let older_count = candidates.len() - recent.len();

    // ── Build the summarize prompt ─────────────────────────────────
    let instruction = ctx.templates.load("compact_prompt", COMPACTION_FALLBACK);
    let mut summary_input = messages.clone();
    match summary_input.iter().rposition(|m| m.role == Role::User) {
        Some(index) => {
            summary_input[index].content = MessageContent::Text(instruction);
            summary_input[index].reasoning_content = None;
        }
        None => summary_input.push(Message::user(instruction)),
    }
    if summary_input
        .first()
        .map(|m| m.role == Role::System)
        .unwrap_or(false)
    {
        let head = summary_input[0].clone();
        let remaining = limit.saturating_sub(estimate_message(&head)).max(1);
        let rest = trim_messages_keep_tail(&summary_input[1..], remaining);
        summary_input = std::iter::once(head).chain(rest).collect();
    } else {
        summary_input = trim_messages_keep_tail(&summary_input, limit);
    }
    let per_message_cap = COMPACTION_SUMMARY_MESSAGE_MAX_TOKENS.min(limit.max(1));
    let summary_input = prepare_summary_messages(&summary_input, per_message_cap);

    // ── Locate the covered-until boundary in persisted history ─────
    let compacted_until_ts = match ctx
        .workspace
        .load_history(ctx.user_id, ctx.session_id, ctx.max_history_items)
        .await
    {
        Ok(rows) => {
            let (items, _) = history::build_compaction_candidates(&rows);
            (older_count > 0 && older_count <= items.len())
                .then(|| items[older_count - 1].timestamp)
                .filter(|ts| *ts > 0.0)
        }
        Err(_) => None,
    };

    // ── Summarize ──────────────────────────────────────────────────
    let mut summary_output = COMPACTION_SUMMARY_MAX_OUTPUT;
    if ctx.model.max_output > 0 {
        summary_output = summary_output.min(ctx.model.max_output);
    }
    ctx.emitter.emit(
        EventType::LlmRequest,
        serde_json::json!({
            "model": ctx.model.model,
            "purpose": "compaction_summary",
            "messages": summary_input.len(),
        }),
    );
    let request = CompletionRequest {
        messages: summary_input,
        model: ctx.model.clone(),
        max_output: Some(summary_output),
    };
    let (summary_text, fallback) = match ctx.llm.complete(request).await {
        Ok(completion) => (completion.content, false),
        Err(e) => {
            tracing::warn!(
                session_id = ctx.session_id,
                error = %e,
                "compaction summary failed, using fallback"
            );
            (
                "earlier context was compacted but the summary is unavailable".to_string(),
                true,
            )
        }
    };
    let summary_text = history::format_compaction_summary(&summary_text);
    ctx.emitter.emit(
        EventType::LlmResponse,
        serde_json::json!({
            "content": summary_text,
            "reasoning": "",
            "purpose": "compaction_summary",
        }),
    );

    // ── Persist the summary row before using the rebuilt context ───
    let mut meta = serde_json::json!({"type": COMPACTION_META_TYPE});
    if let Some(ts) = compacted_until_ts {
        meta["compacted_until_ts"] = serde_json::json!(ts);
    }
    ctx.workspace
        .append_chat(
            ctx.user_id,
            ChatRecord {
                role: "system".into(),
                content: serde_json::Value::String(summary_text.clone()),
                session_id: ctx.session_id.to_string(),
                timestamp: now_ts(),
                meta: Some(meta),
                reasoning_content: None,
            },
        )
        .await?;

    // ── Rebuild ────────────────────────────────────────────────────
    let mut rebuilt = Vec::new();
    if let Some(system) = system_message {
        rebuilt.push(system);
    }
    rebuilt.push(Message::system(summary_text.clone()));
    let artifact_block =
        history::load_artifact_index_message(ctx.workspace, ctx.user_id, ctx.session_id)
            .await
            .unwrap_or_default();
    if !artifact_block.is_empty() {
        rebuilt.push(Message::system(artifact_block));
    }
    rebuilt.extend(recent);
    let rebuilt = shrink_messages_to_limit(rebuilt, limit);
    let rebuilt_tokens = estimate_messages(&rebuilt);

    apply_history_reset(ctx, triggered_by_history, reset, rebuilt_tokens).await?;

    payload["status"] = if fallback { "fallback" } else { "done" }.into();
    payload["summary_tokens"] = approx_tokens(&summary_text).into();
    payload["total_tokens_after"] = rebuilt_tokens.into();
    ctx.emitter.emit(EventType::Compaction, payload);

    Ok(rebuilt)
}
