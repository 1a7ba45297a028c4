/// Shared error type used across all Relay crates.
///
/// Variants that surface to clients carry a stable code via [`Error::code`];
/// everything else is wrapped as `Internal` at the edge.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("user busy: {0}")]
    UserBusy(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage: {0}")]
    Storage(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code reported in `error` events and
    /// client-facing payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::UserBusy(_) => "USER_BUSY",
            Error::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Error::ToolExecution(_) => "TOOL_EXECUTION_ERROR",
            Error::LlmUnavailable(_) => "LLM_UNAVAILABLE",
            Error::Cancelled => "CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
