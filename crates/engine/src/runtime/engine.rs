//! The per-request driver: admission → registration → prompt + history
//! assembly → the bounded reason–act loop → terminal bookkeeping.
//!
//! Entry points are [`run`] (unary) and [`sse_stream`] (streaming). Both
//! funnel into [`execute_request`], which owns the admission lock, the
//! heartbeat, and the terminal status transition for the session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use rand::Rng;

use relay_domain::chat::{
    ChatRecord, ContentPart, ImageUrl, Message, MessageContent, ToolOutcome, ToolSpec, Usage,
};
use relay_domain::config::{LlmModelConfig, RelayConfig};
use relay_domain::constants::{
    A2UI_TOOL, ARTIFACT_TOOLS, FINAL_RESPONSE_TOOL,
};
use relay_domain::event::EventType;
use relay_domain::request::{AgentRequest, AgentResponse, Attachment, AttachmentKind};
use relay_domain::tokens::{approx_tokens, estimate_messages};
use relay_domain::{Error, Result};
use relay_providers::{CompletionRequest, LlmError};
use relay_skills::SkillRegistry;
use relay_storage::now_ts;

use crate::state::EngineState;

use super::compact::{self, CompactContext};
use super::emitter::EventEmitter;
use super::history;
use super::memory::MemoryTask;
use super::monitor::SessionMonitor;
use super::parser;
use super::replace_data_urls;
use super::stream_bus;
use super::tools::{ToolContext, ToolDispatcher};

/// Default answer when the loop exhausts its rounds without a reply.
const NO_FINAL_ANSWER: &str = "no final answer was produced within the round limit";
/// Default note when a2ui returns UI messages without text.
const A2UI_FALLBACK_ANSWER: &str = "rendered an interactive response";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request preparation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A validated, normalized request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub user_id: String,
    pub question: String,
    pub session_id: String,
    pub stream: bool,
    pub tool_names: Option<Vec<String>>,
    pub model_name: Option<String>,
    pub config_overrides: Option<serde_json::Value>,
    pub attachments: Vec<Attachment>,
}

pub fn prepare_request(request: &AgentRequest) -> Result<PreparedRequest> {
    request.validate()?;
    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(relay_domain::request::generate_session_id);

    let tool_names = request.tool_names.as_ref().map(|names| {
        let mut seen = HashSet::new();
        names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty() && seen.insert(n.clone()))
            .collect()
    });

    let attachments = request
        .attachments
        .iter()
        .filter(|a| !a.content.trim().is_empty())
        .cloned()
        .collect();

    Ok(PreparedRequest {
        user_id: request.user_id.trim().to_string(),
        question: request.question.trim().to_string(),
        session_id,
        stream: request.stream,
        tool_names,
        model_name: request
            .model_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        config_overrides: request.config_overrides.clone(),
        attachments,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a request to completion and return the aggregated response.
pub async fn run(state: EngineState, request: AgentRequest) -> Result<AgentResponse> {
    let prepared = prepare_request(&request)?;
    let emitter = EventEmitter::new(
        prepared.session_id.clone(),
        Arc::clone(&state.monitor),
        None,
    );
    execute_request(state, prepared, emitter).await
}

/// Run a request and stream its events as SSE frames. The background
/// runner keeps executing even if the returned stream is dropped.
pub fn sse_stream(
    state: EngineState,
    request: AgentRequest,
) -> Result<impl Stream<Item = String> + Send> {
    let prepared = prepare_request(&request)?;
    let (sender, rx) = stream_bus::channel(
        state.storage.clone(),
        &prepared.session_id,
        &prepared.user_id,
    );
    let emitter = EventEmitter::new(
        prepared.session_id.clone(),
        Arc::clone(&state.monitor),
        Some(sender),
    );
    let consumer = stream_bus::consume(rx, state.storage.clone(), prepared.session_id.clone());

    tokio::spawn({
        let state = state.clone();
        async move {
            // Failures surfaced as error events inside execute_request.
            let _ = execute_request(state, prepared, emitter).await;
        }
    });

    Ok(consumer.map(|event| event.to_sse_frame()))
}

/// Request cancellation of a running session. Emits the `cancel` event
/// and flips the monitor flag the loop polls at its checkpoints.
pub fn cancel_session(state: &EngineState, session_id: &str) -> bool {
    if !state.monitor.cancel(session_id) {
        return false;
    }
    state.monitor.record_event(
        session_id,
        EventType::Cancel,
        &serde_json::json!({"requested": true}),
    );
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution shell: admission, heartbeat, terminal bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) async fn execute_request(
    state: EngineState,
    prepared: PreparedRequest,
    emitter: Arc<EventEmitter>,
) -> Result<AgentResponse> {
    let session_id = prepared.session_id.clone();

    let acquired = state
        .limiter
        .acquire(&session_id, &prepared.user_id)
        .await?;
    if !acquired {
        let error = Error::UserBusy("the user already has an active session".into());
        emit_error(&emitter, &error);
        emitter.finish().await;
        return Err(error);
    }

    let heartbeat = state.limiter.spawn_heartbeat(&session_id);
    let result = execute_inner(&state, &prepared, &emitter).await;

    match &result {
        Ok(_) => {
            state.monitor.mark_finished(&session_id);
            emitter.emit(EventType::Finished, serde_json::json!({"status": "finished"}));
        }
        Err(Error::Cancelled) => {
            emit_error(&emitter, &Error::Cancelled);
            emitter.emit(EventType::Cancelled, serde_json::json!({}));
            state.monitor.mark_cancelled(&session_id);
        }
        Err(error @ Error::UserBusy(_)) => {
            // No terminal transition: the session belongs to another
            // in-flight request.
            emit_error(&emitter, error);
        }
        Err(error) => {
            emit_error(&emitter, error);
            state.monitor.mark_error(&session_id, &error.to_string());
        }
    }

    heartbeat.abort();
    state.limiter.release(&session_id).await;
    emitter.finish().await;
    result
}

fn emit_error(emitter: &EventEmitter, error: &Error) {
    emitter.emit(
        EventType::Error,
        serde_json::json!({
            "code": error.code(),
            "message": error.to_string(),
        }),
    );
}

fn ensure_not_cancelled(monitor: &SessionMonitor, session_id: &str) -> Result<()> {
    if monitor.is_cancelled(session_id) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The reason–act loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn execute_inner(
    state: &EngineState,
    prepared: &PreparedRequest,
    emitter: &Arc<EventEmitter>,
) -> Result<AgentResponse> {
    let user_id = &prepared.user_id;
    let session_id = &prepared.session_id;

    if !state
        .monitor
        .try_register(session_id, user_id, &prepared.question)
    {
        return Err(Error::UserBusy(
            "the user already has an active session".into(),
        ));
    }
    emitter.emit(
        EventType::Received,
        serde_json::json!({"question": prepared.question}),
    );

    // ── Resolve config, model, tools, prompt ───────────────────────
    let base_config = state.current_config();
    let config = base_config.with_overrides(prepared.config_overrides.as_ref())?;
    let model = config.resolve_model(prepared.model_name.as_deref())?;
    let skills = if prepared.config_overrides.is_some() {
        Arc::new(SkillRegistry::load(
            &config.skills.paths,
            &config.skills.enabled,
        ))
    } else {
        state.current_skills()
    };
    let workspace_root = state.workspace.ensure_workspace(user_id)?;
    let user_aliases = state.user_tools.read().clone();

    let builtin_specs = collect_builtin_specs(state, &config);
    let available = collect_available_tools(&builtin_specs, &skills, &user_aliases);
    let (allowed, allow_remote): (HashSet<String>, bool) = match &prepared.tool_names {
        Some(names) => (names.iter().cloned().collect(), false),
        None => (available.iter().map(|spec| spec.name.clone()).collect(), true),
    };
    let tool_specs: Vec<ToolSpec> = available
        .into_iter()
        .filter(|spec| allowed.contains(&spec.name))
        .collect();

    let system_prompt = resolve_session_prompt(
        state,
        prepared,
        &skills,
        &tool_specs,
        &allowed,
        &workspace_root,
    )
    .await?;

    let history_messages = history::load_history_messages(
        &state.workspace,
        user_id,
        session_id,
        config.workspace.max_history_items,
    )
    .await?;

    let mut messages = vec![Message::system(system_prompt)];
    messages.extend(history_messages);
    messages.push(build_user_message(&prepared.question, &prepared.attachments));

    state
        .workspace
        .append_chat(
            user_id,
            ChatRecord {
                role: "user".into(),
                content: serde_json::Value::String(prepared.question.clone()),
                session_id: session_id.clone(),
                timestamp: now_ts(),
                meta: None,
                reasoning_content: None,
            },
        )
        .await?;

    let dispatcher = ToolDispatcher::new(
        Arc::clone(&state.executors),
        Arc::clone(&skills),
        user_aliases,
        allowed,
        allow_remote,
        config.sandbox.mode,
        Arc::clone(emitter),
        Arc::clone(&state.monitor),
        ToolContext {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            workspace_root,
            security: config.security.clone(),
        },
    );

    // ── Loop ───────────────────────────────────────────────────────
    let max_rounds = model.max_rounds.max(1);
    let mut answer = String::new();
    let mut a2ui_uid: Option<String> = None;
    let mut a2ui_messages: Option<Vec<serde_json::Value>> = None;
    let mut last_usage: Option<Usage> = None;
    let mut last_content = String::new();
    let mut last_reasoning = String::new();
    let mut last_request_snapshot: Option<Vec<Message>> = None;

    'rounds: for round in 1..=max_rounds {
        ensure_not_cancelled(&state.monitor, session_id)?;
        emitter.emit(EventType::RoundStart, serde_json::json!({"round": round}));

        let compact_ctx = CompactContext {
            workspace: &state.workspace,
            llm: state.llm.as_ref(),
            templates: &state.templates,
            model: &model,
            max_history_items: config.workspace.max_history_items,
            user_id,
            session_id,
            emitter,
        };
        messages = compact::maybe_compact(&compact_ctx, messages).await?;
        // Compaction may have spent a while in an LLM call.
        ensure_not_cancelled(&state.monitor, session_id)?;

        last_request_snapshot = Some(snapshot_messages(&messages));
        emitter.emit(
            EventType::Progress,
            serde_json::json!({"stage": "llm_call", "round": round}),
        );

        let outcome = call_llm(
            state,
            &model,
            &messages,
            emitter,
            session_id,
            prepared.stream,
            round,
            true,
        )
        .await?;
        if outcome.usage.total_tokens > 0 {
            last_usage = Some(outcome.usage);
            let _ = state
                .workspace
                .save_session_token_usage(user_id, session_id, outcome.usage.total_tokens)
                .await;
        }
        last_content = outcome.content;
        last_reasoning = outcome.reasoning;

        let calls = parser::parse(&last_content);
        if calls.is_empty() {
            let resolved = parser::strip_tool_calls(&last_content);
            if resolved.is_empty() {
                answer = last_content.trim().to_string();
                append_assistant_chat(state, user_id, session_id, &last_content, &last_reasoning)
                    .await?;
            } else {
                answer = resolved.clone();
                append_assistant_chat(state, user_id, session_id, &resolved, &last_reasoning)
                    .await?;
            }
            break;
        }

        let cleaned = parser::strip_tool_calls(&last_content);
        if !cleaned.is_empty() {
            let mut assistant = Message::assistant(cleaned.clone());
            if !last_reasoning.is_empty() {
                assistant.reasoning_content = Some(last_reasoning.clone());
            }
            messages.push(assistant);
            append_assistant_chat(state, user_id, session_id, &cleaned, &last_reasoning).await?;
        }

        for call in calls {
            ensure_not_cancelled(&state.monitor, session_id)?;

            if call.name == FINAL_RESPONSE_TOOL {
                answer = resolve_final_answer_from_tool(&call.arguments);
                log_sentinel_tool(state, user_id, session_id, &call.name, &call.arguments).await;
                if !answer.is_empty() {
                    append_assistant_chat(state, user_id, session_id, &answer, "").await?;
                }
                break;
            }
            if call.name == A2UI_TOOL {
                let (uid, ui_messages, note) =
                    resolve_a2ui_payload(&call.arguments, user_id, session_id);
                if !ui_messages.is_empty() {
                    emitter.emit(
                        EventType::A2ui,
                        serde_json::json!({
                            "uid": uid,
                            "messages": ui_messages,
                            "content": note,
                        }),
                    );
                }
                answer = if note.is_empty() {
                    A2UI_FALLBACK_ANSWER.to_string()
                } else {
                    note
                };
                a2ui_uid = (!uid.is_empty()).then_some(uid);
                a2ui_messages = (!ui_messages.is_empty()).then_some(ui_messages);
                log_sentinel_tool(state, user_id, session_id, &call.name, &call.arguments).await;
                append_assistant_chat(state, user_id, session_id, &answer, "").await?;
                break;
            }

            let outcome = dispatcher.dispatch(&call).await?;
            let observation = build_tool_observation(&call.name, &outcome);
            messages.push(Message::observation(observation.clone()));

            state
                .workspace
                .append_chat(
                    user_id,
                    ChatRecord {
                        role: "tool".into(),
                        content: serde_json::Value::String(observation),
                        session_id: session_id.clone(),
                        timestamp: now_ts(),
                        meta: None,
                        reasoning_content: None,
                    },
                )
                .await?;
            state
                .workspace
                .append_tool_log(
                    user_id,
                    relay_domain::chat::ToolLogRecord {
                        tool: call.name.clone(),
                        session_id: session_id.clone(),
                        ok: outcome.ok,
                        error: outcome.error.clone(),
                        args: call.arguments.clone(),
                        data: outcome.data.clone(),
                        timestamp: now_ts(),
                        sandbox: outcome.sandbox,
                    },
                )
                .await?;
            if ARTIFACT_TOOLS.contains(&call.name.as_str()) {
                append_artifact_logs(state, user_id, session_id, &call.name, &call.arguments, &outcome)
                    .await;
            }
            dispatcher.release_sandbox_if_needed(&call.name).await;
            ensure_not_cancelled(&state.monitor, session_id)?;
        }

        if !answer.is_empty() {
            break 'rounds;
        }
    }

    if answer.is_empty() {
        answer = parser::strip_tool_calls(&last_content);
    }
    if answer.is_empty() && !last_reasoning.is_empty() {
        answer = last_reasoning.trim().to_string();
    }
    if answer.is_empty() {
        answer = NO_FINAL_ANSWER.to_string();
    }

    // Normal completion only: queue the long-term memory digest.
    state
        .memory
        .enqueue(MemoryTask {
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            queued_time: now_ts(),
            config_overrides: prepared.config_overrides.clone(),
            model_name: prepared.model_name.clone(),
            attachments: prepared.attachments.clone(),
            request_messages: last_request_snapshot,
            final_answer: answer.clone(),
        })
        .await;

    let usage = last_usage.filter(|u| u.total_tokens > 0);
    emitter.emit(
        EventType::Final,
        serde_json::json!({
            "answer": answer,
            "usage": usage.map(|u| serde_json::to_value(u).unwrap_or_default())
                .unwrap_or(serde_json::json!({})),
        }),
    );

    Ok(AgentResponse {
        session_id: session_id.clone(),
        answer,
        usage,
        uid: a2ui_uid,
        a2ui: a2ui_messages,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM invocation (unary + streaming with retry)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LlmCallOutcome {
    content: String,
    reasoning: String,
    usage: Usage,
}

enum StreamAttempt {
    Done {
        content: String,
        reasoning: String,
        usage: Option<Usage>,
    },
    Failed {
        error: LlmError,
        emitted_chars: usize,
    },
}

#[allow(clippy::too_many_arguments)]
async fn call_llm(
    state: &EngineState,
    model: &LlmModelConfig,
    messages: &[Message],
    emitter: &Arc<EventEmitter>,
    session_id: &str,
    stream: bool,
    round: u32,
    emit_events: bool,
) -> Result<LlmCallOutcome> {
    ensure_not_cancelled(&state.monitor, session_id)?;
    if emit_events {
        emitter.emit(
            EventType::LlmRequest,
            serde_json::json!({
                "model": model.model,
                "round": round,
                "messages": snapshot_messages(messages),
            }),
        );
    }

    let (content, reasoning, response_usage) = if stream {
        stream_with_retry(state, model, messages, emitter, session_id, round, emit_events).await?
    } else {
        let completion = state
            .llm
            .complete(CompletionRequest::new(messages.to_vec(), model.clone()))
            .await
            .map_err(map_llm_error)?;
        ensure_not_cancelled(&state.monitor, session_id)?;
        (completion.content, completion.reasoning, completion.usage)
    };

    if emit_events {
        emitter.emit(
            EventType::LlmOutput,
            serde_json::json!({
                "content": content,
                "reasoning": reasoning,
                "round": round,
            }),
        );
    }

    let usage = match response_usage.filter(|u| u.total_tokens > 0) {
        Some(usage) => usage,
        None => {
            let input_tokens = estimate_messages(messages);
            let output_tokens = approx_tokens(&content) + approx_tokens(&reasoning);
            Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            }
        }
    };
    if emit_events {
        emitter.emit(
            EventType::TokenUsage,
            serde_json::to_value(usage).unwrap_or_default(),
        );
    }

    Ok(LlmCallOutcome {
        content,
        reasoning,
        usage,
    })
}

async fn stream_with_retry(
    state: &EngineState,
    model: &LlmModelConfig,
    messages: &[Message],
    emitter: &Arc<EventEmitter>,
    session_id: &str,
    round: u32,
    emit_events: bool,
) -> Result<(String, String, Option<Usage>)> {
    let max_attempts = model.retry.max(1);
    let mut attempt = 1;
    loop {
        let result = stream_attempt(state, model, messages, emitter, session_id, round, emit_events)
            .await?;
        match result {
            StreamAttempt::Done {
                content,
                reasoning,
                usage,
            } => return Ok((content, reasoning, usage)),
            StreamAttempt::Failed {
                error,
                emitted_chars,
            } => {
                let retryable = error.is_retryable_stream();
                if !retryable || attempt >= max_attempts {
                    if emit_events && retryable {
                        emitter.emit(
                            EventType::LlmStreamRetry,
                            serde_json::json!({
                                "round": round,
                                "attempt": attempt,
                                "max_attempts": max_attempts,
                                "reset_output": false,
                                "emitted_chars": emitted_chars,
                                "will_retry": false,
                                "final": true,
                                "reason": "max_attempts_reached",
                            }),
                        );
                    }
                    return Err(map_llm_error(error));
                }
                let delay = stream_backoff(attempt);
                if emit_events {
                    emitter.emit(
                        EventType::LlmStreamRetry,
                        serde_json::json!({
                            "round": round,
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                            "delay_s": (delay.as_secs_f64() * 100.0).round() / 100.0,
                            "reset_output": emitted_chars > 0,
                            "emitted_chars": emitted_chars,
                            "will_retry": true,
                            "final": false,
                        }),
                    );
                }
                ensure_not_cancelled(&state.monitor, session_id)?;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn stream_attempt(
    state: &EngineState,
    model: &LlmModelConfig,
    messages: &[Message],
    emitter: &Arc<EventEmitter>,
    session_id: &str,
    round: u32,
    emit_events: bool,
) -> Result<StreamAttempt> {
    let request = CompletionRequest::new(messages.to_vec(), model.clone());
    let mut stream = match state.llm.stream_complete(request).await {
        Ok(stream) => stream,
        Err(error) => {
            return Ok(StreamAttempt::Failed {
                error,
                emitted_chars: 0,
            })
        }
    };

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut usage: Option<Usage> = None;
    let mut emitted_chars = 0usize;

    while let Some(item) = stream.next().await {
        ensure_not_cancelled(&state.monitor, session_id)?;
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(error) => {
                return Ok(StreamAttempt::Failed {
                    error,
                    emitted_chars,
                })
            }
        };
        if let Some(chunk_usage) = chunk.usage.filter(|u| u.total_tokens > 0) {
            usage = Some(chunk_usage);
        }
        let delta = chunk.content_delta.unwrap_or_default();
        let reasoning_delta = chunk.reasoning_delta.unwrap_or_default();
        if delta.is_empty() && reasoning_delta.is_empty() {
            continue;
        }
        if emit_events {
            emitter.emit(
                EventType::LlmOutputDelta,
                serde_json::json!({
                    "delta": delta,
                    "reasoning_delta": reasoning_delta,
                    "round": round,
                }),
            );
        }
        emitted_chars += delta.len() + reasoning_delta.len();
        content.push_str(&delta);
        reasoning.push_str(&reasoning_delta);
    }
    ensure_not_cancelled(&state.monitor, session_id)?;
    Ok(StreamAttempt::Done {
        content,
        reasoning,
        usage,
    })
}

/// Exponential backoff with ±10% jitter: `200ms × 2^(attempt−1)`.
fn stream_backoff(attempt: u32) -> Duration {
    let base_ms = 200u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base_ms as f64 * jitter / 1000.0)
}

fn map_llm_error(error: LlmError) -> Error {
    Error::LlmUnavailable(error.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn collect_builtin_specs(state: &EngineState, config: &RelayConfig) -> Vec<ToolSpec> {
    let specs = state.executors.builtin.specs();
    if config.tools.builtin_enabled.is_empty() {
        return specs;
    }
    specs
        .into_iter()
        .filter(|spec| config.tools.builtin_enabled.iter().any(|n| n == &spec.name))
        .collect()
}

fn collect_available_tools(
    builtin_specs: &[ToolSpec],
    skills: &SkillRegistry,
    user_aliases: &HashMap<String, super::tools::UserToolBinding>,
) -> Vec<ToolSpec> {
    let mut specs: Vec<ToolSpec> = builtin_specs.to_vec();
    for skill in skills.list() {
        if specs.iter().any(|s| s.name == skill.name) {
            continue;
        }
        specs.push(ToolSpec {
            name: skill.name.clone(),
            description: skill.description.clone(),
            args_schema: skill.input_schema.clone(),
        });
    }
    for (alias, binding) in user_aliases {
        if specs.iter().any(|s| s.name == *alias) {
            continue;
        }
        specs.push(ToolSpec {
            name: alias.clone(),
            description: format!("user tool over {}", binding.target),
            args_schema: serde_json::json!({"type": "object", "additionalProperties": true}),
        });
    }
    specs
}

/// Reuse the session's stored system prompt when one exists (so replayed
/// history lines up with the prompt that produced it); otherwise compose
/// and persist a fresh one.
async fn resolve_session_prompt(
    state: &EngineState,
    prepared: &PreparedRequest,
    skills: &SkillRegistry,
    tool_specs: &[ToolSpec],
    allowed: &HashSet<String>,
    workspace_root: &std::path::Path,
) -> Result<String> {
    if let Some(stored) = state
        .workspace
        .load_session_system_prompt(&prepared.user_id, &prepared.session_id)
        .await?
    {
        if !stored.trim().is_empty() {
            return Ok(stored);
        }
    }

    let overrides_canonical = prepared
        .config_overrides
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default();
    let allowed_sorted: Vec<String> = {
        let mut names: Vec<String> = allowed.iter().cloned().collect();
        names.sort_unstable();
        names
    };
    let skill_refs: Vec<&relay_skills::SkillSpec> = skills.list();
    let tree = state.workspace.get_workspace_tree(&prepared.user_id);
    let workdir = workspace_root.display().to_string();
    let prompt = state.composer.compose(&super::prompt::PromptInputs {
        user_id: &prepared.user_id,
        config_version: state
            .config_version
            .load(std::sync::atomic::Ordering::SeqCst),
        workspace_tree_version: state.workspace.get_tree_version(&prepared.user_id),
        workdir: &workdir,
        overrides_canonical: &overrides_canonical,
        allowed_tools: &allowed_sorted,
        user_tool_version: state
            .user_tool_version
            .load(std::sync::atomic::Ordering::SeqCst),
        shared_tool_version: state
            .shared_tool_version
            .load(std::sync::atomic::Ordering::SeqCst),
        tool_specs,
        skills: &skill_refs,
        workspace_tree: &tree,
        user_extra_prompt: None,
    });

    state
        .workspace
        .save_session_system_prompt(&prepared.user_id, &prepared.session_id, &prompt, None)
        .await?;
    Ok(prompt)
}

fn build_user_message(question: &str, attachments: &[Attachment]) -> Message {
    if attachments.is_empty() {
        return Message::user(question);
    }
    let mut parts = vec![ContentPart::Text {
        text: question.to_string(),
    }];
    for attachment in attachments {
        match attachment.kind {
            AttachmentKind::File => parts.push(ContentPart::Text {
                text: format!("[file: {}]\n{}", attachment.name, attachment.content),
            }),
            AttachmentKind::Image => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: attachment.content.clone(),
                },
            }),
        }
    }
    Message {
        role: relay_domain::chat::Role::User,
        content: MessageContent::Parts(parts),
        reasoning_content: None,
    }
}

/// Copy messages for logging/snapshots: image payloads collapse to
/// placeholders so base64 never lands in logs or memory tasks.
fn snapshot_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| {
            let mut copy = message.clone();
            copy.content = match &message.content {
                MessageContent::Text(text) => MessageContent::Text(replace_data_urls(text)),
                MessageContent::Parts(parts) => MessageContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::Text { text } => ContentPart::Text {
                                text: replace_data_urls(text),
                            },
                            ContentPart::ImageUrl { .. } => ContentPart::Text {
                                text: "[image]".to_string(),
                            },
                        })
                        .collect(),
                ),
            };
            copy
        })
        .collect()
}

async fn append_assistant_chat(
    state: &EngineState,
    user_id: &str,
    session_id: &str,
    content: &str,
    reasoning: &str,
) -> Result<()> {
    state
        .workspace
        .append_chat(
            user_id,
            ChatRecord {
                role: "assistant".into(),
                content: serde_json::Value::String(content.to_string()),
                session_id: session_id.to_string(),
                timestamp: now_ts(),
                meta: None,
                reasoning_content: (!reasoning.is_empty()).then(|| reasoning.to_string()),
            },
        )
        .await
}

/// Sentinel tools (final_response/a2ui) still land in the tool log for
/// analytics even though they never dispatch.
async fn log_sentinel_tool(
    state: &EngineState,
    user_id: &str,
    session_id: &str,
    tool: &str,
    args: &serde_json::Value,
) {
    let result = state
        .workspace
        .append_tool_log(
            user_id,
            relay_domain::chat::ToolLogRecord {
                tool: tool.to_string(),
                session_id: session_id.to_string(),
                ok: true,
                error: None,
                args: args.clone(),
                data: serde_json::json!({}),
                timestamp: now_ts(),
                sandbox: None,
            },
        )
        .await;
    if let Err(e) = result {
        tracing::warn!(tool, error = %e, "sentinel tool log failed");
    }
}

fn build_tool_observation(tool: &str, outcome: &ToolOutcome) -> String {
    let mut payload = serde_json::json!({
        "tool": tool,
        "ok": outcome.ok,
        "data": outcome.data,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    if let Some(error) = &outcome.error {
        payload["error"] = serde_json::Value::String(error.clone());
    }
    payload.to_string()
}

fn resolve_final_answer_from_tool(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => {
            let value = map.get("content").or_else(|| map.get("answer"));
            match value {
                Some(serde_json::Value::String(text)) => text.trim().to_string(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        }
        serde_json::Value::String(text) => text.trim().to_string(),
        _ => String::new(),
    }
}

/// Parse a2ui arguments into `(uid, messages, note)`. Messages missing a
/// surface id get the uid injected into their first surface operation.
fn resolve_a2ui_payload(
    args: &serde_json::Value,
    user_id: &str,
    session_id: &str,
) -> (String, Vec<serde_json::Value>, String) {
    let mut uid = String::new();
    let mut note = String::new();
    let mut raw_messages = if let Some(map) = args.as_object() {
        uid = map
            .get("uid")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        note = map
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        map.get("a2ui")
            .or_else(|| map.get("messages"))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    } else {
        args.clone()
    };

    if uid.is_empty() {
        uid = if !session_id.is_empty() {
            session_id.to_string()
        } else {
            user_id.to_string()
        };
    }

    if let Some(text) = raw_messages.as_str() {
        raw_messages = serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
    }
    let items = match raw_messages {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => vec![serde_json::Value::Object(map)],
        _ => Vec::new(),
    };

    const SURFACE_OPS: [&str; 4] = [
        "beginRendering",
        "surfaceUpdate",
        "dataModelUpdate",
        "deleteSurface",
    ];
    let mut messages = Vec::new();
    for item in items {
        let Some(map) = item.as_object() else {
            continue;
        };
        let mut normalized = map.clone();
        for op in SURFACE_OPS {
            if let Some(serde_json::Value::Object(payload)) = normalized.get(op) {
                if !uid.is_empty() && payload.get("surfaceId").is_none() {
                    let mut patched = payload.clone();
                    patched.insert(
                        "surfaceId".to_string(),
                        serde_json::Value::String(uid.clone()),
                    );
                    normalized.insert(op.to_string(), serde_json::Value::Object(patched));
                }
                break;
            }
        }
        messages.push(serde_json::Value::Object(normalized));
    }

    (uid, messages, note)
}

async fn append_artifact_logs(
    state: &EngineState,
    user_id: &str,
    session_id: &str,
    tool: &str,
    args: &serde_json::Value,
    outcome: &ToolOutcome,
) {
    for record in build_artifact_entries(tool, args, outcome, session_id) {
        if let Err(e) = state.workspace.append_artifact_log(user_id, record).await {
            tracing::warn!(tool, error = %e, "artifact log failed");
        }
    }
}

fn extract_string_list(args: &serde_json::Value, singular: &str, plural: &str) -> Vec<String> {
    let mut values = Vec::new();
    if let Some(one) = args.get(singular).and_then(|v| v.as_str()) {
        if !one.trim().is_empty() {
            values.push(one.trim().to_string());
        }
    }
    if let Some(many) = args.get(plural).and_then(|v| v.as_array()) {
        for item in many {
            if let Some(text) = item.as_str() {
                if !text.trim().is_empty() {
                    values.push(text.trim().to_string());
                }
            }
        }
    }
    values
}

/// Derive artifact rows from a tool invocation. File tools record per
/// path; execute records command lines; ptc records the script.
fn build_artifact_entries(
    tool: &str,
    args: &serde_json::Value,
    outcome: &ToolOutcome,
    session_id: &str,
) -> Vec<relay_domain::chat::ArtifactRecord> {
    let mut meta = serde_json::json!({});
    if let Some(returncode) = outcome.data.get("returncode") {
        meta["returncode"] = returncode.clone();
    }
    let base = |kind: &str, action: &str, name: String| relay_domain::chat::ArtifactRecord {
        kind: kind.to_string(),
        action: action.to_string(),
        name,
        ok: outcome.ok,
        error: outcome.error.clone(),
        meta: meta.clone(),
        tool: tool.to_string(),
        session_id: session_id.to_string(),
        timestamp: now_ts(),
    };

    match tool {
        "read" => extract_string_list(args, "path", "paths")
            .into_iter()
            .map(|path| base("file", "read", path))
            .collect(),
        "write" | "replace" | "edit" => extract_string_list(args, "path", "paths")
            .into_iter()
            .map(|path| base("file", tool, path))
            .collect(),
        "execute" => extract_string_list(args, "command", "commands")
            .into_iter()
            .map(|command| base("command", "execute", command))
            .collect(),
        "ptc" => {
            let name = args
                .get("path")
                .or_else(|| args.get("file"))
                .and_then(|v| v.as_str())
                .unwrap_or("script")
                .to_string();
            vec![base("script", "run", name)]
        }
        _ => Vec::new(),
    }
}
