use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Event types emitted by the engine. The wire strings are part of the
/// client contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Received,
    Progress,
    RoundStart,
    LlmRequest,
    LlmOutputDelta,
    LlmOutput,
    LlmResponse,
    ToolCall,
    ToolResult,
    TokenUsage,
    Compaction,
    A2ui,
    Final,
    Error,
    Cancel,
    Cancelled,
    Finished,
    LlmStreamRetry,
    Restart,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Received => "received",
            EventType::Progress => "progress",
            EventType::RoundStart => "round_start",
            EventType::LlmRequest => "llm_request",
            EventType::LlmOutputDelta => "llm_output_delta",
            EventType::LlmOutput => "llm_output",
            EventType::LlmResponse => "llm_response",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::TokenUsage => "token_usage",
            EventType::Compaction => "compaction",
            EventType::A2ui => "a2ui",
            EventType::Final => "final",
            EventType::Error => "error",
            EventType::Cancel => "cancel",
            EventType::Cancelled => "cancelled",
            EventType::Finished => "finished",
            EventType::LlmStreamRetry => "llm_stream_retry",
            EventType::Restart => "restart",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event for one session.
///
/// `event_id` is a per-session monotonic sequence number used for SSE
/// resequencing. It is emitted as the SSE `id:` line and never appears
/// inside the serialized `data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub event_id: u64,
}

impl StreamEvent {
    pub fn new(event_type: EventType, session_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
            event_id: 0,
        }
    }

    /// Render as one SSE frame: `id:<N>\nevent:<type>\ndata:<json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(&SsePayload {
            event_type: self.event_type,
            session_id: &self.session_id,
            data: &self.data,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
        .unwrap_or_else(|_| "{}".into());
        format!(
            "id:{}\nevent:{}\ndata:{}\n\n",
            self.event_id, self.event_type, data
        )
    }
}

/// Serialization shape for SSE `data` — identical to [`StreamEvent`] but
/// with a string timestamp pinned to ISO8601Z.
#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: EventType,
    session_id: &'a str,
    data: &'a serde_json::Value,
    timestamp: String,
}
