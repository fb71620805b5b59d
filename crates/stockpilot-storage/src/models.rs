#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String, // "user", "assistant", "system", "tool"
    pub content: String,
    pub thinking_summary: Option<String>,
    pub tool_calls: Option<serde_json::Value>,
    pub embedding_model: Option<String>,
    pub embedding_status: String, // "pending", "processing", "completed", "failed"
    pub created_at: String,
}

/// Message payload for insertion; ids and timestamps are assigned by the
/// database inside the turn transaction.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
    pub thinking_summary: Option<String>,
    pub tool_calls: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        NewMessage {
            role: "user".into(),
            content: content.into(),
            thinking_summary: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        NewMessage {
            role: "assistant".into(),
            content: content.into(),
            thinking_summary: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: String,
    pub kind: String, // "fact", "preference", "entity", "procedure"
    pub content: String,
    pub content_hash: String,
    pub confidence: f64,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
    pub is_invalidated: bool,
    pub access_count: i64,
    pub last_accessed_at: Option<String>,
    pub source_conversation_id: Option<i64>,
    pub source_message_id: Option<i64>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Typed embedding-job target. The finite set of embeddable entities is an
/// enum, not a free-form table-name string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    Message(i64),
    Memory(i64),
}

impl JobTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            JobTarget::Message(_) => "message",
            JobTarget::Memory(_) => "memory",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            JobTarget::Message(id) | JobTarget::Memory(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "message" => Some(JobTarget::Message(id)),
            "memory" => Some(JobTarget::Memory(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub id: i64,
    pub target: JobTarget,
    pub status: String, // "pending", "processing", "completed", "failed", "dead"
    pub retries: i64,
    pub max_retries: i64,
    pub locked_at: Option<String>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub status: String, // "pending", "completed", "failed", "conflict"
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
