use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StockPilotError {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("Rate limited, retry after backoff")]
    RateLimited,

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Assistant unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Client-facing error taxonomy. Internal detail stays in logs; the class is
/// what the wire protocol carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Recoverable,
    Fatal,
    Timeout,
    RateLimit,
}

impl StockPilotError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StockPilotError::RateLimited => ErrorClass::RateLimit,
            StockPilotError::Timeout(_) => ErrorClass::Timeout,
            StockPilotError::Unavailable(_) | StockPilotError::Config(_) => ErrorClass::Fatal,
            _ => ErrorClass::Recoverable,
        }
    }
}
