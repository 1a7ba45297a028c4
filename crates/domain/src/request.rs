use serde::{Deserialize, Serialize};

use crate::chat::Usage;
use crate::error::{Error, Result};

/// An inbound agent request, already decoded from the transport layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRequest {
    pub user_id: String,
    pub question: String,
    /// Fresh 32-hex id minted when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "d_true")]
    pub stream: bool,
    /// `None` = all available tools; `Some([])` = no tools.
    #[serde(default)]
    pub tool_names: Option<Vec<String>>,
    /// Selects a named LLM config.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Sparse deep-merge over the effective config.
    #[serde(default)]
    pub config_overrides: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

fn d_true() -> bool {
    true
}

impl AgentRequest {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::InvalidRequest("user_id is required".into()));
        }
        if self.question.trim().is_empty() {
            return Err(Error::InvalidRequest("question is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub name: String,
    /// File text, or a data URL for images.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The unary response shape.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub session_id: String,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Present iff the a2ui tool was invoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a2ui: Option<Vec<serde_json::Value>>,
}

/// Mint a fresh 32-char lowercase hex session id.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_blank_fields() {
        let mut req = AgentRequest {
            user_id: "u1".into(),
            question: "hi".into(),
            ..Default::default()
        };
        assert!(req.validate().is_ok());
        req.question = "   ".into();
        assert!(matches!(req.validate(), Err(Error::InvalidRequest(_))));
        req.question = "hi".into();
        req.user_id = String::new();
        assert!(matches!(req.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn session_id_is_32_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn request_defaults() {
        let req: AgentRequest =
            serde_json::from_str(r#"{"user_id":"u","question":"q"}"#).unwrap();
        assert!(req.stream);
        assert!(req.tool_names.is_none());
        assert!(req.attachments.is_empty());
    }
}
