use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;

/// Event kinds of the streaming protocol. `done` is always the last event of
/// a successful turn; `error` terminates the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TextDelta,
    ThinkingDelta,
    ToolCallStart,
    ToolCallDelta,
    ToolCallEnd,
    ToolResult,
    ConfirmationRequired,
    ConfirmationResponse,
    Error,
    Cancel,
    Done,
}

/// One wire event. `sequence` is scoped to the turn and strictly increasing;
/// `event_id` lets a reconnecting consumer deduplicate replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub sequence: u64,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorClass>,
}

impl StreamEvent {
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn with_confirmation_id(mut self, id: impl Into<String>) -> Self {
        self.confirmation_id = Some(id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, class: ErrorClass) -> Self {
        self.error = Some(message.into());
        self.error_type = Some(class);
        self
    }
}

/// Stamps events with the turn-scoped sequence number and a fresh event id.
/// One sequencer per turn; never shared across turns.
#[derive(Debug, Default)]
pub struct EventSeq {
    next: u64,
}

impl EventSeq {
    pub fn new() -> Self {
        EventSeq { next: 0 }
    }

    pub fn stamp(&mut self, kind: EventKind) -> StreamEvent {
        let sequence = self.next;
        self.next += 1;
        StreamEvent {
            kind,
            sequence,
            event_id: uuid::Uuid::new_v4().to_string(),
            data: None,
            tool_call_id: None,
            confirmation_id: None,
            error: None,
            error_type: None,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.next
    }
}
