//! End-to-end engine tests against a scripted fake LLM.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;

use relay_domain::chat::{ToolOutcome, ToolSpec, Usage};
use relay_domain::config::{LlmModelConfig, RelayConfig};
use relay_domain::request::AgentRequest;
use relay_providers::{
    BoxStream, Completion, CompletionRequest, LlmClient, LlmError, LlmResult, StreamChunk,
};
use relay_storage::{now_ts, Storage};

use relay_engine::runtime::engine::{self, cancel_session};
use relay_engine::runtime::monitor::SessionStatus;
use relay_engine::runtime::tools::{ExecutorSet, ToolContext, ToolExecutor};
use relay_engine::EngineState;

const FAKE_ANSWER: &str = "测试回复";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fakes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scripted LLM: pops queued responses, falling back to `"测试回复"`.
struct FakeLlm {
    responses: Mutex<VecDeque<String>>,
    chunk_delay: Option<Duration>,
    /// Number of leading stream attempts that die mid-stream.
    failing_stream_attempts: AtomicU32,
}

impl FakeLlm {
    fn new() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn scripted(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            chunk_delay: None,
            failing_stream_attempts: AtomicU32::new(0),
        })
    }

    fn slow(chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            chunk_delay: Some(chunk_delay),
            failing_stream_attempts: AtomicU32::new(0),
        })
    }

    fn flaky(failing_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            chunk_delay: None,
            failing_stream_attempts: AtomicU32::new(failing_attempts),
        })
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| FAKE_ANSWER.to_string())
    }
}

#[async_trait::async_trait]
impl LlmClient for FakeLlm {
    async fn complete(&self, _req: CompletionRequest) -> LlmResult<Completion> {
        Ok(Completion {
            content: self.next_response(),
            reasoning: String::new(),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    async fn stream_complete(
        &self,
        _req: CompletionRequest,
    ) -> LlmResult<BoxStream<'static, LlmResult<StreamChunk>>> {
        let content = self.next_response();
        let delay = self.chunk_delay;
        let fail = self
            .failing_stream_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();

        let stream = async_stream::stream! {
            let chars: Vec<String> = content.chars().map(|c| c.to_string()).collect();
            // A chunk per character keeps delta events plentiful.
            let mut emitted = 0usize;
            for piece in &chars {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if fail && emitted == 1 {
                    yield Err(LlmError::IncompleteStream("stream cut".into()));
                    return;
                }
                yield Ok(StreamChunk {
                    content_delta: Some(piece.clone()),
                    reasoning_delta: None,
                    usage: None,
                });
                emitted += 1;
            }
            yield Ok(StreamChunk {
                content_delta: None,
                reasoning_delta: None,
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                }),
            });
        };
        Ok(Box::pin(stream))
    }
}

struct EchoTool;

#[async_trait::async_trait]
impl ToolExecutor for EchoTool {
    fn specs(&self) -> Vec<ToolSpec> {
        ["echo", "read", "write", "execute", "ptc"]
            .iter()
            .map(|name| ToolSpec {
                name: name.to_string(),
                description: format!("{name} tool"),
                args_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> ToolOutcome {
        ToolOutcome::ok(serde_json::json!({"tool": name, "echo": args}))
    }
}

fn test_config(workspace_root: &std::path::Path, model: LlmModelConfig) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.workspace.root = workspace_root.to_path_buf();
    config.llm.models.insert("main".into(), model);
    config.llm.default_model = "main".into();
    config
}

fn build_state(llm: Arc<dyn LlmClient>, model: LlmModelConfig) -> (tempfile::TempDir, EngineState) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::open_in_memory().unwrap();
    let executors = Arc::new(ExecutorSet {
        builtin: Arc::new(EchoTool),
        mcp: None,
        a2a: None,
        sandbox: None,
        knowledge: None,
    });
    let config = test_config(&tmp.path().join("ws"), model);
    let state = EngineState::new(config, storage, llm, executors, tmp.path().join("prompts"));
    (tmp, state)
}

fn request(user: &str, question: &str, stream: bool) -> AgentRequest {
    AgentRequest {
        user_id: user.into(),
        question: question.into(),
        stream,
        ..Default::default()
    }
}

/// Split SSE frames into `(id, event_type, data)` triples.
fn parse_frames(frames: &[String]) -> Vec<(u64, String, serde_json::Value)> {
    frames
        .iter()
        .map(|frame| {
            let mut id = 0;
            let mut event_type = String::new();
            let mut data = serde_json::Value::Null;
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("id:") {
                    id = rest.trim().parse().unwrap();
                } else if let Some(rest) = line.strip_prefix("event:") {
                    event_type = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = serde_json::from_str(rest.trim()).unwrap();
                }
            }
            (id, event_type, data)
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn unary_happy_path() {
    let (_tmp, state) = build_state(FakeLlm::new(), LlmModelConfig::default());
    let response = engine::run(state.clone(), request("u1", "hi", false))
        .await
        .unwrap();

    assert_eq!(response.answer, FAKE_ANSWER);
    assert_eq!(response.session_id.len(), 32);
    assert!(response.session_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(response.usage.unwrap().total_tokens, 15);
    assert!(response.uid.is_none());

    let record = state.monitor.get(&response.session_id).unwrap();
    assert_eq!(record.status, SessionStatus::Finished);
    assert!(record.ended_time.is_some());

    // user + assistant rows persisted
    let history = state
        .storage
        .load_chat_history("u1", &response.session_id, None)
        .unwrap();
    let roles: Vec<&str> = history.iter().map(|r| r.role.as_str()).collect();
    assert!(roles.contains(&"user"));
    assert!(roles.contains(&"assistant"));
}

#[tokio::test]
async fn streaming_emits_ordered_events() {
    let (_tmp, state) = build_state(FakeLlm::new(), LlmModelConfig::default());
    let stream = engine::sse_stream(state, request("u1", "hi", true)).unwrap();
    let frames: Vec<String> = stream.collect().await;
    let parsed = parse_frames(&frames);

    // strictly ascending ids with no gaps
    for window in parsed.windows(2) {
        assert_eq!(window[1].0, window[0].0 + 1, "event ids must be contiguous");
    }

    let types: Vec<&str> = parsed.iter().map(|(_, t, _)| t.as_str()).collect();
    let progress = types.iter().position(|t| *t == "progress").unwrap();
    let llm_output = types.iter().position(|t| *t == "llm_output").unwrap();
    let final_pos = types.iter().position(|t| *t == "final").unwrap();
    assert!(progress < llm_output && llm_output < final_pos);
    assert!(types.contains(&"llm_output_delta"));
    assert!(types.contains(&"token_usage"));

    let (_, _, final_data) = &parsed[final_pos];
    assert_eq!(final_data["data"]["answer"], FAKE_ANSWER);
    assert_eq!(final_data["type"], "final");
    assert!(final_data.get("event_id").is_none());
}

#[tokio::test]
async fn admission_refusal_is_user_busy() {
    let (_tmp, state) = build_state(FakeLlm::new(), LlmModelConfig::default());
    // Hold the user's slot through a foreign lock row.
    state
        .storage
        .try_acquire_session_lock("other-session", "u1", 4, 60.0)
        .unwrap();

    let error = engine::run(state, request("u1", "hi", false))
        .await
        .unwrap_err();
    assert_eq!(error.code(), "USER_BUSY");
}

#[tokio::test]
async fn tool_round_trip_pairs_events() {
    let llm = FakeLlm::scripted(vec![
        r#"<tool_call>{"name":"echo","arguments":{"value":1}}</tool_call>"#,
        FAKE_ANSWER,
    ]);
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    let response = engine::run(state.clone(), request("u1", "run the echo", false))
        .await
        .unwrap();
    assert_eq!(response.answer, FAKE_ANSWER);

    let record = state.monitor.get(&response.session_id).unwrap();
    let calls = record
        .events
        .iter()
        .filter(|e| e.event_type == "tool_call")
        .count();
    let results = record
        .events
        .iter()
        .filter(|e| e.event_type == "tool_result")
        .count();
    assert_eq!(calls, 1);
    assert_eq!(calls, results);

    // observation persisted as a tool row
    let history = state
        .storage
        .load_chat_history("u1", &response.session_id, None)
        .unwrap();
    let tool_row = history.iter().find(|r| r.role == "tool").unwrap();
    let observation: serde_json::Value =
        serde_json::from_str(tool_row.content.as_str().unwrap()).unwrap();
    assert_eq!(observation["tool"], "echo");
    assert_eq!(observation["ok"], true);

    // tool log captured independently
    let stats = state.storage.tool_usage_stats(Some("u1")).unwrap();
    assert_eq!(stats[0].tool, "echo");
}

#[tokio::test]
async fn max_rounds_exhaustion_yields_default_answer() {
    let llm = FakeLlm::scripted(vec![
        r#"<tool_call>{"name":"echo","arguments":{}}</tool_call>"#,
    ]);
    let model = LlmModelConfig {
        max_rounds: 1,
        ..Default::default()
    };
    let (_tmp, state) = build_state(llm, model);
    let response = engine::run(state.clone(), request("u1", "loop forever", false))
        .await
        .unwrap();
    assert!(response.answer.contains("no final answer"));
    assert_eq!(
        state.monitor.get(&response.session_id).unwrap().status,
        SessionStatus::Finished
    );
}

#[tokio::test]
async fn final_response_tool_short_circuits() {
    let llm = FakeLlm::scripted(vec![
        r#"<tool_call>{"name":"final_response","arguments":{"content":"done deal"}}</tool_call>"#,
    ]);
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    let response = engine::run(state, request("u1", "finish", false))
        .await
        .unwrap();
    assert_eq!(response.answer, "done deal");
}

#[tokio::test]
async fn a2ui_tool_returns_ui_payload() {
    let llm = FakeLlm::scripted(vec![
        r#"<tool_call>{"name":"a2ui","arguments":{"uid":"surf-1","messages":[{"beginRendering":{"root":"card"}}],"content":"see the card"}}</tool_call>"#,
    ]);
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    let response = engine::run(state.clone(), request("u1", "show ui", false))
        .await
        .unwrap();
    assert_eq!(response.answer, "see the card");
    assert_eq!(response.uid.as_deref(), Some("surf-1"));
    assert_eq!(response.a2ui.as_ref().unwrap().len(), 1);

    let record = state.monitor.get(&response.session_id).unwrap();
    assert!(record.events.iter().any(|e| e.event_type == "a2ui"));
}

#[tokio::test]
async fn cancel_mid_flight_ends_with_cancelled() {
    let llm = FakeLlm::slow(Duration::from_millis(80));
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());

    let mut req = request("u1", "long task", true);
    req.session_id = Some("aaaabbbbccccddddeeeeffff00001111".into());
    let stream = engine::sse_stream(state.clone(), req).unwrap();

    let canceller = tokio::spawn({
        let state = state.clone();
        async move {
            // let the stream get past the first llm_request
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(cancel_session(&state, "aaaabbbbccccddddeeeeffff00001111"));
        }
    });

    let frames: Vec<String> = stream.collect().await;
    canceller.await.unwrap();
    let parsed = parse_frames(&frames);
    let types: Vec<&str> = parsed.iter().map(|(_, t, _)| t.as_str()).collect();

    let error_pos = types.iter().position(|t| *t == "error").unwrap();
    let cancelled_pos = types.iter().position(|t| *t == "cancelled").unwrap();
    assert!(error_pos < cancelled_pos);
    assert_eq!(parsed[error_pos].2["data"]["code"], "CANCELLED");

    assert_eq!(
        state
            .monitor
            .get("aaaabbbbccccddddeeeeffff00001111")
            .unwrap()
            .status,
        SessionStatus::Cancelled
    );
}

#[tokio::test]
async fn stream_retry_recovers_from_incomplete_stream() {
    let llm = FakeLlm::flaky(1);
    let model = LlmModelConfig {
        retry: 2,
        ..Default::default()
    };
    let (_tmp, state) = build_state(llm, model);
    let stream = engine::sse_stream(state.clone(), request("u1", "hi", true)).unwrap();
    let frames: Vec<String> = stream.collect().await;
    let parsed = parse_frames(&frames);
    let types: Vec<&str> = parsed.iter().map(|(_, t, _)| t.as_str()).collect();

    let retry_pos = types.iter().position(|t| *t == "llm_stream_retry").unwrap();
    assert_eq!(parsed[retry_pos].2["data"]["will_retry"], true);
    assert_eq!(parsed[retry_pos].2["data"]["attempt"], 1);

    let final_pos = types.iter().position(|t| *t == "final").unwrap();
    assert!(retry_pos < final_pos);
    assert_eq!(parsed[final_pos].2["data"]["answer"], FAKE_ANSWER);
}

#[tokio::test]
async fn compaction_triggers_and_persists_summary_row() {
    // Summary call answers first, then the round's reply.
    let llm = FakeLlm::scripted(vec!["recap of the earlier work", FAKE_ANSWER]);
    let model = LlmModelConfig {
        max_context: 1200,
        max_output: 256,
        ..Default::default()
    };
    let (_tmp, state) = build_state(llm, model);

    // Seed enough history to blow past the compaction limit.
    for i in 0..6 {
        let question = format!("q{i} {}", "x".repeat(900));
        let answer = format!("a{i} {}", "y".repeat(900));
        state
            .storage
            .append_chat(
                "u1",
                &relay_domain::chat::ChatRecord {
                    role: "user".into(),
                    content: serde_json::Value::String(question),
                    session_id: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
                    timestamp: now_ts() - 100.0 + i as f64,
                    meta: None,
                    reasoning_content: None,
                },
            )
            .unwrap();
        state
            .storage
            .append_chat(
                "u1",
                &relay_domain::chat::ChatRecord {
                    role: "assistant".into(),
                    content: serde_json::Value::String(answer),
                    session_id: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
                    timestamp: now_ts() - 99.5 + i as f64,
                    meta: None,
                    reasoning_content: None,
                },
            )
            .unwrap();
    }

    let mut req = request("u1", "continue", false);
    req.session_id = Some("deadbeefdeadbeefdeadbeefdeadbeef".into());
    let response = engine::run(state.clone(), req).await.unwrap();
    assert_eq!(response.answer, FAKE_ANSWER);

    let record = state.monitor.get(&response.session_id).unwrap();
    let compaction = record
        .events
        .iter()
        .find(|e| e.event_type == "compaction")
        .expect("compaction event emitted");
    assert_eq!(compaction.data["status"], "done");

    let history = state
        .storage
        .load_chat_history("u1", &response.session_id, None)
        .unwrap();
    let summary_row = history
        .iter()
        .find(|r| r.meta_type() == Some("compaction_summary"))
        .expect("summary row persisted");
    assert!(summary_row
        .content
        .as_str()
        .unwrap()
        .contains("recap of the earlier work"));
}

#[tokio::test]
async fn memory_task_runs_after_completion() {
    let llm = FakeLlm::scripted(vec![
        FAKE_ANSWER,
        "<memory_summary>user is testing relay</memory_summary>",
    ]);
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    state.memory.set_enabled("u1", true).await.unwrap();

    let response = engine::run(state.clone(), request("u1", "hello", false))
        .await
        .unwrap();
    state.memory.drain().await;

    let records = state.storage.load_memory_records("u1", 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, response.session_id);
    assert_eq!(records[0].summary, "user is testing relay");

    let logs = state.storage.load_memory_task_logs(Some(5)).unwrap();
    assert_eq!(logs[0].status, "finished");
}

#[tokio::test]
async fn memory_disabled_skips_task() {
    let (_tmp, state) = build_state(FakeLlm::new(), LlmModelConfig::default());
    engine::run(state.clone(), request("u1", "hello", false))
        .await
        .unwrap();
    state.memory.drain().await;
    assert!(state.storage.load_memory_records("u1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn denied_tool_feeds_observation_back() {
    let llm = FakeLlm::scripted(vec![
        r#"<tool_call>{"name":"echo","arguments":{}}</tool_call>"#,
        FAKE_ANSWER,
    ]);
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    let mut req = request("u1", "try a disabled tool", false);
    req.tool_names = Some(vec!["read".into()]); // echo not allowed
    let response = engine::run(state.clone(), req).await.unwrap();
    assert_eq!(response.answer, FAKE_ANSWER);

    let history = state
        .storage
        .load_chat_history("u1", &response.session_id, None)
        .unwrap();
    let tool_row = history.iter().find(|r| r.role == "tool").unwrap();
    let observation: serde_json::Value =
        serde_json::from_str(tool_row.content.as_str().unwrap()).unwrap();
    assert_eq!(observation["ok"], false);
    assert_eq!(observation["error"], "tool disabled or unavailable");
}

#[tokio::test]
async fn same_session_resubmission_rejected_while_running() {
    let llm = FakeLlm::slow(Duration::from_millis(100));
    let (_tmp, state) = build_state(llm, LlmModelConfig::default());
    let mut first = request("u1", "long", true);
    first.session_id = Some("11112222333344445555666677778888".into());
    let stream = engine::sse_stream(state.clone(), first).unwrap();
    let collector = tokio::spawn(stream.collect::<Vec<String>>());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let mut second = request("u1", "again", false);
    second.session_id = Some("11112222333344445555666677778888".into());
    let error = engine::run(state.clone(), second).await.unwrap_err();
    assert_eq!(error.code(), "USER_BUSY");

    cancel_session(&state, "11112222333344445555666677778888");
    collector.await.unwrap();
}
