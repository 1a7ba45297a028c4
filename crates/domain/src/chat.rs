use serde::{Deserialize, Serialize};

use crate::constants::OBSERVATION_PREFIX;

/// A tool invocation parsed from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Uniform result shape returned by every tool executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the call was delegated to the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<bool>,
}

impl ToolOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            sandbox: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: serde_json::Value::Null,
            error: Some(message.into()),
            sandbox: None,
        }
    }
}

/// Tool definition exposed to the LLM in the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub args_schema: serde_json::Value,
}

/// Token usage reported by (or estimated for) an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(()),
        }
    }
}

/// Message content: plain text or a multimodal part array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl MessageContent {
    /// Join all text content; image parts are skipped.
    pub fn all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A message in the LLM context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Reasoning trace carried by thinking models; counted toward the
    /// context budget but never shown to end users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            reasoning_content: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            reasoning_content: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            reasoning_content: None,
        }
    }

    /// A tool observation, re-roled as `user` with the observation prefix
    /// so it cannot be mistaken for real user input.
    pub fn observation(payload: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(format!("{OBSERVATION_PREFIX}{}", payload.into())),
            reasoning_content: None,
        }
    }

    /// True when this message is a tool observation (§ glossary).
    pub fn is_observation(&self) -> bool {
        self.role == Role::User
            && matches!(
                &self.content,
                MessageContent::Text(t) if t.starts_with(OBSERVATION_PREFIX)
            )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted chat rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A durable conversation row. `content` is stored as JSON so multimodal
/// part arrays round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub role: String,
    pub content: serde_json::Value,
    pub session_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatRecord {
    pub fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }
}

/// A durable per-tool-invocation row, independent of chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLogRecord {
    pub tool: String,
    pub session_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<bool>,
}

/// A derived provenance row feeding the artifact index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// `file`, `command` or `script`.
    pub kind: String,
    /// `read`, `write`, `replace`, `edit`, `execute` or `run`.
    pub action: String,
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub tool: String,
    pub session_id: String,
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_roundtrip() {
        let msg = Message::observation("{\"ok\":true}");
        assert!(msg.is_observation());
        assert_eq!(msg.role, Role::User);
        assert!(msg.content.all_text().starts_with(OBSERVATION_PREFIX));
    }

    #[test]
    fn plain_user_message_is_not_observation() {
        let msg = Message::user("tool_responses are great");
        assert!(!msg.is_observation());
    }

    #[test]
    fn content_all_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,xyz".into(),
                },
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(content.all_text(), "a\nb");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&Usage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn content_part_serializes_with_type_tag() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "http://x/y.png".into(),
            },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["url"], "http://x/y.png");
    }
}
