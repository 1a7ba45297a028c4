//! Long-term memory digestion.
//!
//! When a request completes normally and the user has memory enabled, a
//! summary task is queued. A single lazily-started worker drains the
//! queue in `queued_time` order, asks the LLM for a digest with a
//! lowered output budget, normalizes the text, and upserts it into the
//! capped per-user record table. Task failures are logged and never
//! reach the request path.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use relay_domain::chat::{ContentPart, Message, MessageContent, Role};
use relay_domain::config::RelayConfig;
use relay_domain::constants::{
    COMPACTION_SUMMARY_MAX_OUTPUT, COMPACTION_SUMMARY_MESSAGE_MAX_TOKENS, MAX_MEMORY_RECORDS,
};
use relay_domain::request::Attachment;
use relay_domain::tokens::{estimate_message, estimate_messages, trim_messages_to_budget};
use relay_domain::Result;
use relay_providers::{CompletionRequest, LlmClient};
use relay_storage::{now_ts, MemoryRecord, MemoryTaskLog, Storage};

use crate::prompts::{PromptTemplates, MEMORY_SUMMARY_FALLBACK};
use crate::workspace::WorkspaceManager;

use super::compact::prepare_summary_messages;
use super::history;
use super::parser::strip_tool_calls;

/// One queued summarization task. Snapshots everything the worker needs
/// so the session can keep moving underneath it.
#[derive(Debug, Clone)]
pub struct MemoryTask {
    pub task_id: String,
    pub user_id: String,
    pub session_id: String,
    pub queued_time: f64,
    pub config_overrides: Option<serde_json::Value>,
    pub model_name: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Message snapshot from the request's last LLM call; when absent the
    /// worker reloads history from storage.
    pub request_messages: Option<Vec<Message>>,
    pub final_answer: String,
}

struct QueuedTask {
    queued_time: f64,
    seq: u64,
    task: MemoryTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.queued_time
            .total_cmp(&other.queued_time)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct MemoryService {
    storage: Storage,
    workspace: Arc<WorkspaceManager>,
    llm: Arc<dyn LlmClient>,
    templates: Arc<PromptTemplates>,
    config: Arc<RwLock<Arc<RelayConfig>>>,
    queue: Mutex<BinaryHeap<Reverse<QueuedTask>>>,
    seq: AtomicU64,
    notify: Notify,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    active_task: Mutex<Option<String>>,
}

impl MemoryService {
    pub fn new(
        storage: Storage,
        workspace: Arc<WorkspaceManager>,
        llm: Arc<dyn LlmClient>,
        templates: Arc<PromptTemplates>,
        config: Arc<RwLock<Arc<RelayConfig>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            workspace,
            llm,
            templates,
            config,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            worker: Mutex::new(None),
            active_task: Mutex::new(None),
        })
    }

    // ── Per-user switch ────────────────────────────────────────────

    pub async fn is_enabled(&self, user_id: &str) -> bool {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        tokio::task::spawn_blocking(move || storage.get_memory_enabled(&user))
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten()
            .unwrap_or(false)
    }

    pub async fn set_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        tokio::task::spawn_blocking(move || storage.set_memory_enabled(&user, enabled))
            .await
            .map_err(|e| relay_domain::Error::Internal(format!("memory task: {e}")))?
    }

    // ── Queue ──────────────────────────────────────────────────────

    /// Queue a task if the user has memory enabled; starts the worker on
    /// first use.
    pub async fn enqueue(self: &Arc<Self>, task: MemoryTask) {
        if !self.is_enabled(&task.user_id).await {
            return;
        }
        self.log_task_status(&task, "queued", 0.0, 0.0, "", "").await;
        {
            let mut queue = self.queue.lock();
            queue.push(Reverse(QueuedTask {
                queued_time: task.queued_time,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                task,
            }));
        }
        self.ensure_worker();
        self.notify.notify_one();
    }

    fn ensure_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        let running = worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        let service = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            service.worker_loop().await;
        }));
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop();
            let Some(Reverse(queued)) = next else {
                self.notify.notified().await;
                continue;
            };
            let task = queued.task;
            *self.active_task.lock() = Some(task.task_id.clone());
            let started = now_ts();
            let result = self.run_task(&task).await;
            let finished = now_ts();
            let elapsed = (finished - started).max(0.0);
            match result {
                Ok(summary) => {
                    self.log_task_status(&task, "finished", started, finished, &summary, "")
                        .await;
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        task_id = %task.task_id,
                        session_id = %task.session_id,
                        error = %message,
                        elapsed_s = elapsed,
                        "memory summary task failed"
                    );
                    let _ = self.storage.write_system_log(
                        "ERROR",
                        "memory_summary",
                        &message,
                        Some(&serde_json::json!({
                            "user_id": task.user_id,
                            "session_id": task.session_id,
                        })),
                    );
                    self.log_task_status(&task, "failed", started, finished, "", &message)
                        .await;
                }
            }
            *self.active_task.lock() = None;
        }
    }

    async fn run_task(&self, task: &MemoryTask) -> Result<String> {
        if !self.is_enabled(&task.user_id).await {
            return Ok(String::new());
        }

        // Re-resolve config with the task's overrides; lower the output
        // budget for a digest-sized reply.
        let base = self.config.read().clone();
        let config = base.with_overrides(task.config_overrides.as_ref())?;
        let mut model = config.resolve_model(task.model_name.as_deref())?;
        if model.max_output == 0 || model.max_output > COMPACTION_SUMMARY_MAX_OUTPUT {
            model.max_output = COMPACTION_SUMMARY_MAX_OUTPUT;
        }
        model.max_rounds = 1;

        let source_messages = match &task.request_messages {
            Some(messages) => messages.clone(),
            None => {
                history::load_history_messages(
                    &self.workspace,
                    &task.user_id,
                    &task.session_id,
                    config.workspace.max_history_items,
                )
                .await?
            }
        };
        let user_content = build_summary_user_content(&source_messages, &task.final_answer);
        let instruction = self.templates.load("memory_summary", MEMORY_SUMMARY_FALLBACK);
        let mut messages = vec![Message::system(instruction), Message::user(user_content)];

        messages = prepare_summary_messages(&messages, COMPACTION_SUMMARY_MESSAGE_MAX_TOKENS);
        if let Some(limit) = history::get_auto_compact_limit(&model) {
            if estimate_messages(&messages) > limit && messages.len() > 1 {
                let system_tokens = estimate_message(&messages[0]);
                let remaining = limit.saturating_sub(system_tokens).max(1);
                let tail = trim_messages_to_budget(&messages[1..], remaining);
                messages = std::iter::once(messages[0].clone()).chain(tail).collect();
            }
        }

        let completion = self
            .llm
            .complete(CompletionRequest {
                messages,
                model,
                max_output: Some(COMPACTION_SUMMARY_MAX_OUTPUT),
            })
            .await
            .map_err(|e| relay_domain::Error::LlmUnavailable(e.to_string()))?;

        let summary = normalize_summary(&strip_tool_calls(&completion.content));
        if summary.is_empty() {
            return Ok(String::new());
        }

        let storage = self.storage.clone();
        let user = task.user_id.clone();
        let session = task.session_id.clone();
        let record_summary = summary.clone();
        tokio::task::spawn_blocking(move || {
            storage.upsert_memory_record(&user, &session, &record_summary, MAX_MEMORY_RECORDS)
        })
        .await
        .map_err(|e| relay_domain::Error::Internal(format!("memory task: {e}")))??;
        Ok(summary)
    }

    async fn log_task_status(
        &self,
        task: &MemoryTask,
        status: &str,
        started: f64,
        finished: f64,
        result: &str,
        error: &str,
    ) {
        let payload = serde_json::json!({
            "user_id": task.user_id,
            "session_id": task.session_id,
            "model_name": task.model_name,
            "final_answer": task.final_answer,
        });
        let log = MemoryTaskLog {
            task_id: task.task_id.clone(),
            user_id: task.user_id.clone(),
            session_id: task.session_id.clone(),
            status: status.to_string(),
            queued_time: task.queued_time,
            started_time: started,
            finished_time: finished,
            elapsed_s: (finished - started).max(0.0),
            request_payload: payload.to_string(),
            result: result.to_string(),
            error: error.to_string(),
            updated_time: now_ts(),
        };
        let storage = self.storage.clone();
        let join = tokio::task::spawn_blocking(move || storage.upsert_memory_task_log(&log)).await;
        if let Ok(Err(e)) = join {
            tracing::warn!(error = %e, "memory task log write failed");
        }
    }

    // ── Observability ──────────────────────────────────────────────

    pub fn queue_status(&self) -> serde_json::Value {
        serde_json::json!({
            "pending": self.queue.lock().len(),
            "active_task": self.active_task.lock().clone(),
        })
    }

    pub async fn task_detail(&self, task_id: &str) -> Result<Option<MemoryTaskLog>> {
        let storage = self.storage.clone();
        let task = task_id.to_string();
        tokio::task::spawn_blocking(move || storage.load_memory_task_log_by_task_id(&task))
            .await
            .map_err(|e| relay_domain::Error::Internal(format!("memory task: {e}")))?
    }

    pub async fn list_records(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        tokio::task::spawn_blocking(move || storage.load_memory_records(&user, limit))
            .await
            .map_err(|e| relay_domain::Error::Internal(format!("memory task: {e}")))?
    }

    /// Wait until the queue is idle. Test helper.
    pub async fn drain(&self) {
        loop {
            let idle = self.queue.lock().is_empty() && self.active_task.lock().is_none();
            if idle {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

/// Fuse prior turns into a single labeled transcript, skipping system
/// rows and observations, with the final answer appended when the last
/// assistant turn doesn't already carry it.
pub fn build_summary_user_content(messages: &[Message], final_answer: &str) -> String {
    let mut lines = Vec::new();
    let mut last_assistant = String::new();
    for message in messages {
        if message.role == Role::System || message.is_observation() {
            continue;
        }
        let content = extract_readable_text(&message.content);
        if content.is_empty() {
            continue;
        }
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => unreachable!(),
        };
        lines.push(format!("{label}: {content}"));
        if message.role == Role::Assistant {
            last_assistant = content;
        }
    }
    let final_text = final_answer.trim();
    if !final_text.is_empty() && final_text != last_assistant {
        lines.push(format!("Assistant: {final_text}"));
    }
    lines.join("\n").trim().to_string()
}

fn extract_readable_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => strip_tool_calls(text),
        MessageContent::Parts(parts) => {
            let mut pieces = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        let cleaned = strip_tool_calls(text);
                        if !cleaned.is_empty() {
                            pieces.push(cleaned);
                        }
                    }
                    ContentPart::ImageUrl { .. } => pieces.push("[image]".to_string()),
                }
            }
            pieces.join("\n")
        }
    }
}

/// Normalize a raw model digest into one storable paragraph:
/// `<memory_summary>` tags win, then JSON payloads are flattened, then
/// bullet lists collapse into `；`-joined segments.
pub fn normalize_summary(text: &str) -> String {
    let raw = text.trim();
    if raw.is_empty() {
        return String::new();
    }
    let tagged = extract_tagged_summary(raw);
    let candidate = tagged.as_deref().unwrap_or(raw);
    if let Some(parsed) = parse_summary_payload(candidate) {
        return parsed;
    }
    let segments: Vec<String> = candidate
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*', '•'])
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect();
    match segments.len() {
        0 => String::new(),
        1 => segments.into_iter().next().unwrap_or_default(),
        _ => segments.join("；"),
    }
}

fn extract_tagged_summary(text: &str) -> Option<String> {
    let pattern = regex::RegexBuilder::new(r"<memory_summary>(.*?)</memory_summary>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .ok()?;
    let parts: Vec<String> = pattern
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn parse_summary_payload(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let segments: Vec<String> = match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(key, value)| {
                let rendered = render_json_segment(&value)?;
                Some(format!("{key}: {rendered}"))
            })
            .collect(),
        serde_json::Value::Array(items) => {
            items.iter().filter_map(render_json_segment).collect()
        }
        _ => return None,
    };
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("；"))
    }
}

fn render_json_segment(value: &serde_json::Value) -> Option<String> {
    let rendered = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => return None,
        other => other.to_string(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prefers_tagged_block() {
        let text = "noise <memory_summary>user prefers Rust</memory_summary> more noise";
        assert_eq!(normalize_summary(text), "user prefers Rust");
    }

    #[test]
    fn normalize_flattens_json_object() {
        let text = r#"{"preference": "dark mode", "language": "Rust"}"#;
        let normalized = normalize_summary(text);
        assert!(normalized.contains("preference: dark mode"));
        assert!(normalized.contains("；"));
    }

    #[test]
    fn normalize_collapses_bullets() {
        let text = "- likes tea\n- works at night\n";
        assert_eq!(normalize_summary(text), "likes tea；works at night");
    }

    #[test]
    fn normalize_single_line_passthrough() {
        assert_eq!(normalize_summary("one plain fact"), "one plain fact");
        assert_eq!(normalize_summary("   "), "");
    }

    #[test]
    fn summary_content_skips_observations_and_system() {
        let messages = vec![
            Message::system("base prompt"),
            Message::user("what is 2+2?"),
            Message::observation("{\"ok\":true}"),
            Message::assistant("4"),
        ];
        let content = build_summary_user_content(&messages, "4");
        assert_eq!(content, "User: what is 2+2?\nAssistant: 4");
    }

    #[test]
    fn summary_content_appends_differing_final_answer() {
        let messages = vec![Message::user("hello")];
        let content = build_summary_user_content(&messages, "hi there");
        assert!(content.ends_with("Assistant: hi there"));
    }

    #[test]
    fn queue_orders_by_queued_time() {
        let mut heap = BinaryHeap::new();
        for (seq, time) in [(0u64, 30.0), (1, 10.0), (2, 20.0)] {
            heap.push(Reverse(QueuedTask {
                queued_time: time,
                seq,
                task: MemoryTask {
                    task_id: format!("t{seq}"),
                    user_id: "u".into(),
                    session_id: format!("s{seq}"),
                    queued_time: time,
                    config_overrides: None,
                    model_name: None,
                    attachments: Vec::new(),
                    request_messages: None,
                    final_answer: String::new(),
                },
            }));
        }
        let order: Vec<f64> = std::iter::from_fn(|| heap.pop().map(|Reverse(q)| q.queued_time))
            .collect();
        assert_eq!(order, vec![10.0, 20.0, 30.0]);
    }
}
