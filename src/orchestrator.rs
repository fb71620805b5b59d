use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::Sender;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, StockPilotError};
use crate::events::{EventKind, EventSeq, StreamEvent};
use crate::llm_types::{
    ContentBlock, Message, MessageContent, ProviderDelta, ResponseContentBlock,
};
use crate::memory;
use crate::runtime::AppState;
use crate::tools::{ToolCallContext, ToolKind, ToolResult};
use stockpilot_storage::db::call_blocking;
use stockpilot_storage::models::{JobTarget, NewMessage, StoredMessage};

/// Turn state machine phases, traced at each transition. `Error` and
/// `Cancelled` are reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Received,
    ContextLoaded,
    Generating,
    ToolPending,
    Redacting,
    Persisted,
    Done,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub conversation_id: Option<i64>,
    pub text: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub conversation_id: Option<i64>,
    pub assistant_text: String,
    pub phase: TurnPhase,
}

/// Pending human-approval exchanges, keyed by confirmation id. The websocket
/// task resolves entries when the client answers.
pub struct ConfirmationHub {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl Default for ConfirmationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationHub {
    pub fn new() -> Self {
        ConfirmationHub {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, confirmation_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(confirmation_id.to_string(), tx);
        rx
    }

    /// Deliver the client's answer. Returns false for unknown or already
    /// resolved ids (consumers must tolerate replayed responses).
    pub async fn resolve(&self, confirmation_id: &str, approved: bool) -> bool {
        match self.pending.lock().await.remove(confirmation_id) {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    pub async fn discard(&self, confirmation_id: &str) {
        self.pending.lock().await.remove(confirmation_id);
    }
}

enum TurnEnd {
    Failed {
        conversation_id: Option<i64>,
        error: StockPilotError,
    },
    Cancelled {
        conversation_id: Option<i64>,
        partial_text: String,
    },
}

/// Run one conversational turn end-to-end. The client always observes either
/// a `done` or an `error`/`cancel` terminal event; provider and tool failures
/// never escape as panics or hangs.
pub async fn run_turn(
    state: &Arc<AppState>,
    req: TurnRequest,
    events: &Sender<StreamEvent>,
    cancel: &mut watch::Receiver<bool>,
) -> TurnOutcome {
    let turn_id = uuid::Uuid::new_v4().to_string();
    let mut seq = EventSeq::new();

    match run_turn_inner(state, &req, events, &mut seq, cancel, &turn_id).await {
        Ok(outcome) => outcome,
        Err(TurnEnd::Failed {
            conversation_id,
            error,
        }) => {
            let class = error.class();
            error!(target: "turn", %turn_id, error = %error, ?class, "Turn failed");
            trace_phase(&turn_id, TurnPhase::Error);
            let evt = seq
                .stamp(EventKind::Error)
                .with_error(client_error_text(class), class);
            emit(events, evt).await;
            TurnOutcome {
                conversation_id,
                assistant_text: String::new(),
                phase: TurnPhase::Error,
            }
        }
        Err(TurnEnd::Cancelled {
            conversation_id,
            partial_text,
        }) => {
            info!(target: "turn", %turn_id, "Turn cancelled by client");
            trace_phase(&turn_id, TurnPhase::Cancelled);
            emit(events, seq.stamp(EventKind::Cancel)).await;
            TurnOutcome {
                conversation_id,
                assistant_text: partial_text,
                phase: TurnPhase::Cancelled,
            }
        }
    }
}

fn trace_phase(turn_id: &str, phase: TurnPhase) {
    debug!(target: "turn", %turn_id, ?phase, "Phase transition");
}

/// Client-facing error text stays generic; detail lives in the logs.
fn client_error_text(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Recoverable => "The assistant hit a temporary problem. Please retry.",
        ErrorClass::Fatal => "The assistant is unavailable right now.",
        ErrorClass::Timeout => "The assistant took too long to respond. Please retry.",
        ErrorClass::RateLimit => "The assistant is rate limited. Please retry in a moment.",
    }
}

async fn emit(events: &Sender<StreamEvent>, evt: StreamEvent) {
    let _ = events.send(evt).await;
}

/// Resolves when the client cancels; pends forever otherwise.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_turn_inner(
    state: &Arc<AppState>,
    req: &TurnRequest,
    events: &Sender<StreamEvent>,
    seq: &mut EventSeq,
    cancel: &mut watch::Receiver<bool>,
    turn_id: &str,
) -> Result<TurnOutcome, TurnEnd> {
    trace_phase(turn_id, TurnPhase::Received);

    let Some(chat) = state.chat.clone() else {
        return Err(TurnEnd::Failed {
            conversation_id: req.conversation_id,
            error: StockPilotError::Unavailable("no chat provider configured".into()),
        });
    };

    // --- Resolve the conversation (created on first user message) ---
    let conversation_id = match req.conversation_id {
        Some(id) => {
            let tenant = req.tenant_id.clone();
            let user = req.user_id.clone();
            let conv = call_blocking(state.db.clone(), move |db| {
                db.get_conversation(id, &tenant, &user)
            })
            .await
            .map_err(|e| TurnEnd::Failed {
                conversation_id: Some(id),
                error: e,
            })?;
            match conv {
                Some(c) => c.id,
                None => {
                    return Err(TurnEnd::Failed {
                        conversation_id: Some(id),
                        error: StockPilotError::NotFound(format!("conversation {id}")),
                    })
                }
            }
        }
        None => {
            let tenant = req.tenant_id.clone();
            let user = req.user_id.clone();
            let title = title_from_text(&req.text);
            call_blocking(state.db.clone(), move |db| {
                db.create_conversation(&tenant, &user, Some(&title))
            })
            .await
            .map_err(|e| TurnEnd::Failed {
                conversation_id: None,
                error: e,
            })?
        }
    };
    let fail = |error: StockPilotError| TurnEnd::Failed {
        conversation_id: Some(conversation_id),
        error,
    };

    // --- Load context: history plus semantically similar memories ---
    let max_history = state.config.max_history_messages;
    let history = call_blocking(state.db.clone(), move |db| {
        db.get_recent_messages(conversation_id, max_history)
    })
    .await
    .map_err(fail)?;
    let mut messages = history_to_provider_messages(&history);

    // Memory retrieval failures are non-fatal; the turn continues without
    // memory context.
    let memories = memory::search_memories(
        &state.db,
        &state.embedding,
        &req.tenant_id,
        &req.user_id,
        &req.text,
        state.config.memory_top_k,
        state.config.memory_candidate_limit,
    )
    .await;
    let system_prompt = build_system_prompt(
        &state.config.assistant_name,
        &memory::memory_context_block(&memories),
    );

    messages.push(Message::user(req.text.clone()));
    trace_phase(turn_id, TurnPhase::ContextLoaded);

    // --- Generation loop, interleaving tool dispatch ---
    let tool_defs = state.tools.definitions().to_vec();
    let mut partial_text = String::new();
    let mut thinking_summary = String::new();
    let mut tool_call_log: Vec<serde_json::Value> = Vec::new();
    let mut total_input_tokens = 0u64;
    let mut total_output_tokens = 0u64;
    let mut final_text: Option<String> = None;

    'generation: for iteration in 0..state.config.max_tool_iterations {
        trace_phase(turn_id, TurnPhase::Generating);

        let (delta_tx, mut delta_rx) = tokio::sync::mpsc::channel::<ProviderDelta>(64);
        let call = {
            let chat = chat.clone();
            let system = system_prompt.clone();
            let msgs = messages.clone();
            let tools = tool_defs.clone();
            tokio::spawn(async move {
                chat.send_message_stream(&system, msgs, Some(tools), Some(&delta_tx))
                    .await
            })
        };

        loop {
            tokio::select! {
                delta = delta_rx.recv() => match delta {
                    Some(ProviderDelta::Text(text)) => {
                        partial_text.push_str(&text);
                        let evt = seq
                            .stamp(EventKind::TextDelta)
                            .with_data(json!({"delta": text}));
                        emit(events, evt).await;
                    }
                    Some(ProviderDelta::Thinking(raw)) => {
                        // Raw reasoning is dropped right here; only the
                        // redacted form is forwarded or accumulated.
                        let redacted = state.redactor.redact(&raw);
                        thinking_summary.push_str(&redacted);
                        let evt = seq
                            .stamp(EventKind::ThinkingDelta)
                            .with_data(json!({"delta": redacted}));
                        emit(events, evt).await;
                    }
                    None => break,
                },
                _ = wait_cancelled(cancel) => {
                    call.abort();
                    return Err(cancel_and_persist(
                        state, conversation_id, req, &partial_text,
                        &thinking_summary, &tool_call_log,
                    )
                    .await);
                }
            }
        }

        let response = match call.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(fail(e)),
            Err(e) => {
                return Err(fail(StockPilotError::ToolExecution(format!(
                    "provider task failed: {e}"
                ))))
            }
        };

        if let Some(usage) = &response.usage {
            total_input_tokens += u64::from(usage.input_tokens);
            total_output_tokens += u64::from(usage.output_tokens);
        }

        let stop_reason = response.stop_reason.as_deref().unwrap_or("end_turn");

        if stop_reason != "tool_use" {
            let text = response
                .content
                .iter()
                .filter_map(|block| match block {
                    ResponseContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            // Providers that did not stream deltas (or compacted replies)
            // still need the text on the wire.
            if partial_text.is_empty() && !text.is_empty() {
                let evt = seq
                    .stamp(EventKind::TextDelta)
                    .with_data(json!({"delta": text}));
                emit(events, evt).await;
            }
            final_text = Some(text);
            break 'generation;
        }

        // tool_use: mirror the response into context, resolve every call,
        // and feed the results back for continued generation.
        trace_phase(turn_id, TurnPhase::ToolPending);
        let assistant_content: Vec<ContentBlock> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => {
                    Some(ContentBlock::Text { text: text.clone() })
                }
                ResponseContentBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                // Raw reasoning never re-enters the context.
                ResponseContentBlock::Thinking { .. } => None,
            })
            .collect();
        messages.push(Message {
            role: "assistant".into(),
            content: MessageContent::Blocks(assistant_content),
        });

        let mut tool_results = Vec::new();
        for block in &response.content {
            if let ResponseContentBlock::ToolUse { id, name, input } = block {
                info!(
                    target: "turn",
                    %turn_id,
                    tool = %name,
                    iteration = iteration + 1,
                    "Executing tool"
                );
                let result = dispatch_tool_call(
                    state, req, events, seq, cancel, conversation_id, id, name, input,
                    &partial_text, &thinking_summary, &tool_call_log,
                )
                .await?;

                tool_call_log.push(json!({
                    "id": id,
                    "name": name,
                    "arguments": input,
                    "result": preview(&result.content, 2000),
                    "is_error": result.is_error,
                }));
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: result.content,
                    is_error: if result.is_error { Some(true) } else { None },
                });
            }
        }

        messages.push(Message {
            role: "user".into(),
            content: MessageContent::Blocks(tool_results),
        });
    }

    let final_text = match final_text {
        Some(text) => text,
        None => {
            // Max iterations reached; cap the turn with an explanation so the
            // client is not left with a tool result as the last thing it saw.
            let fallback = "I reached the maximum number of tool steps for one turn. Please break the request into smaller pieces.".to_string();
            let evt = seq
                .stamp(EventKind::TextDelta)
                .with_data(json!({"delta": fallback}));
            emit(events, evt).await;
            fallback
        }
    };

    // --- Redact, persist, enqueue, finish ---
    trace_phase(turn_id, TurnPhase::Redacting);
    let thinking_summary = if thinking_summary.trim().is_empty() {
        None
    } else {
        Some(state.redactor.redact(&thinking_summary))
    };

    let tool_call_count = tool_call_log.len();
    let user_message = NewMessage::user(req.text.clone());
    let assistant_message = NewMessage {
        role: "assistant".into(),
        content: final_text.clone(),
        thinking_summary,
        tool_calls: if tool_call_log.is_empty() {
            None
        } else {
            Some(json!(tool_call_log))
        },
    };
    let new_messages = vec![user_message, assistant_message];
    let message_ids = call_blocking(state.db.clone(), move |db| {
        db.append_turn_messages(conversation_id, &new_messages)
    })
    .await
    .map_err(fail)?;
    trace_phase(turn_id, TurnPhase::Persisted);

    // Enqueue is idempotent: a unique-constraint no-op counts as success.
    let max_retries = state.config.embed_max_retries;
    for id in &message_ids {
        let id = *id;
        if let Err(e) = call_blocking(state.db.clone(), move |db| {
            db.enqueue_embedding_job(JobTarget::Message(id), max_retries)
        })
        .await
        {
            warn!(target: "turn", %turn_id, message_id = id, error = %e, "Embedding enqueue failed");
        }
    }

    info!(
        target: "turn",
        %turn_id,
        tenant_id = %req.tenant_id,
        conversation_id,
        input_tokens = total_input_tokens,
        output_tokens = total_output_tokens,
        tool_calls = tool_call_count,
        "Turn persisted"
    );

    if state.config.extraction_enabled {
        spawn_fact_extraction(state, req, conversation_id, message_ids.last().copied(), &final_text);
    }

    let evt = seq
        .stamp(EventKind::Done)
        .with_data(json!({"conversation_id": conversation_id}));
    emit(events, evt).await;
    trace_phase(turn_id, TurnPhase::Done);

    Ok(TurnOutcome {
        conversation_id: Some(conversation_id),
        assistant_text: final_text,
        phase: TurnPhase::Done,
    })
}

/// Resolve one model-requested tool call: announce it, run the confirmation
/// round-trip for gated writes, execute, and report the result. A tool
/// failure comes back as a structured error result for the model, never as a
/// dropped call.
#[allow(clippy::too_many_arguments)]
async fn dispatch_tool_call(
    state: &Arc<AppState>,
    req: &TurnRequest,
    events: &Sender<StreamEvent>,
    seq: &mut EventSeq,
    cancel: &mut watch::Receiver<bool>,
    conversation_id: i64,
    tool_call_id: &str,
    name: &str,
    input: &serde_json::Value,
    partial_text: &str,
    thinking_summary: &str,
    tool_call_log: &[serde_json::Value],
) -> Result<ToolResult, TurnEnd> {
    let evt = seq
        .stamp(EventKind::ToolCallStart)
        .with_tool_call_id(tool_call_id)
        .with_data(json!({"name": name}));
    emit(events, evt).await;
    let evt = seq
        .stamp(EventKind::ToolCallDelta)
        .with_tool_call_id(tool_call_id)
        .with_data(json!({"arguments": input}));
    emit(events, evt).await;

    let ctx = ToolCallContext {
        tenant_id: req.tenant_id.clone(),
        user_id: req.user_id.clone(),
        correlation_id: uuid::Uuid::new_v4().to_string(),
        idempotency_key: req.idempotency_key.clone(),
    };

    let needs_confirmation = matches!(
        state.tools.kind_of(name),
        Some(ToolKind::Write {
            requires_confirmation: true
        })
    );

    let result = if needs_confirmation {
        let confirmation_id = uuid::Uuid::new_v4().to_string();
        let evt = seq
            .stamp(EventKind::ConfirmationRequired)
            .with_tool_call_id(tool_call_id)
            .with_confirmation_id(confirmation_id.as_str())
            .with_data(json!({
                "action": name,
                "description": format!(
                    "The assistant wants to run '{name}' with arguments {input}. Approve?"
                ),
            }));
        emit(events, evt).await;

        let rx = state.confirmations.register(&confirmation_id).await;
        let timeout = std::time::Duration::from_secs(state.config.confirmation_timeout_secs);
        let decision = tokio::select! {
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(approved)) => Some(approved),
                // Hub dropped the sender: treat as denial.
                Ok(Err(_)) => Some(false),
                // No answer within the window: denial by policy.
                Err(_) => None,
            },
            _ = wait_cancelled(cancel) => {
                state.confirmations.discard(&confirmation_id).await;
                return Err(cancel_and_persist(
                    state, conversation_id, req, partial_text, thinking_summary, tool_call_log,
                )
                .await);
            }
        };
        state.confirmations.discard(&confirmation_id).await;

        let approved = decision.unwrap_or(false);
        let evt = seq
            .stamp(EventKind::ConfirmationResponse)
            .with_tool_call_id(tool_call_id)
            .with_confirmation_id(confirmation_id.as_str())
            .with_data(json!({"approved": approved, "timed_out": decision.is_none()}));
        emit(events, evt).await;

        if approved {
            execute_with_cancel(
                state, req, cancel, conversation_id, name, input, &ctx, partial_text,
                thinking_summary, tool_call_log,
            )
            .await?
        } else if decision.is_none() {
            // A denial is a successful tool call whose result says so; the
            // same applies when the confirmation window expires.
            ToolResult::success(
                "The user did not respond to the confirmation request in time; the action was not performed.".into(),
            )
        } else {
            ToolResult::success("The user declined the action; it was not performed.".into())
        }
    } else {
        execute_with_cancel(
            state, req, cancel, conversation_id, name, input, &ctx, partial_text,
            thinking_summary, tool_call_log,
        )
        .await?
    };

    let evt = seq
        .stamp(EventKind::ToolResult)
        .with_tool_call_id(tool_call_id)
        .with_data(json!({
            "content": result.content.clone(),
            "is_error": result.is_error,
            "error_type": result.error_type.clone(),
        }));
    emit(events, evt).await;
    let evt = seq
        .stamp(EventKind::ToolCallEnd)
        .with_tool_call_id(tool_call_id);
    emit(events, evt).await;

    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn execute_with_cancel(
    state: &Arc<AppState>,
    req: &TurnRequest,
    cancel: &mut watch::Receiver<bool>,
    conversation_id: i64,
    name: &str,
    input: &serde_json::Value,
    ctx: &ToolCallContext,
    partial_text: &str,
    thinking_summary: &str,
    tool_call_log: &[serde_json::Value],
) -> Result<ToolResult, TurnEnd> {
    tokio::select! {
        result = state.tools.execute(name, input.clone(), ctx) => Ok(result),
        _ = wait_cancelled(cancel) => Err(cancel_and_persist(
            state, conversation_id, req, partial_text, thinking_summary, tool_call_log,
        )
        .await),
    }
}

/// Commit what the client has already seen so the transcript survives the
/// cancel; embedding jobs are intentionally not enqueued, leaving
/// embedding_status pending.
async fn cancel_and_persist(
    state: &Arc<AppState>,
    conversation_id: i64,
    req: &TurnRequest,
    partial_text: &str,
    thinking_summary: &str,
    tool_call_log: &[serde_json::Value],
) -> TurnEnd {
    let mut new_messages = vec![NewMessage::user(req.text.clone())];
    if !partial_text.is_empty() || !tool_call_log.is_empty() {
        new_messages.push(NewMessage {
            role: "assistant".into(),
            content: partial_text.to_string(),
            thinking_summary: if thinking_summary.trim().is_empty() {
                None
            } else {
                Some(state.redactor.redact(thinking_summary))
            },
            tool_calls: if tool_call_log.is_empty() {
                None
            } else {
                Some(json!(tool_call_log))
            },
        });
    }
    if let Err(e) = call_blocking(state.db.clone(), move |db| {
        db.append_turn_messages(conversation_id, &new_messages)
    })
    .await
    {
        warn!(conversation_id, error = %e, "Failed to persist cancelled turn");
    }
    TurnEnd::Cancelled {
        conversation_id: Some(conversation_id),
        partial_text: partial_text.to_string(),
    }
}

fn spawn_fact_extraction(
    state: &Arc<AppState>,
    req: &TurnRequest,
    conversation_id: i64,
    assistant_message_id: Option<i64>,
    assistant_text: &str,
) {
    let Some(chat) = state.chat.clone() else {
        return;
    };
    let Some(message_id) = assistant_message_id else {
        return;
    };
    let state = state.clone();
    let tenant = req.tenant_id.clone();
    let user = req.user_id.clone();
    let transcript = format!("user: {}\nassistant: {}", req.text, assistant_text);
    tokio::spawn(async move {
        let outcome = memory::extract_facts(
            chat.as_ref(),
            &state.db,
            &tenant,
            &user,
            conversation_id,
            message_id,
            &transcript,
            state.config.extraction_max_facts,
            state.config.embed_max_retries,
        )
        .await;
        if let Err(e) = outcome {
            warn!(conversation_id, error = %e, "Fact extraction failed");
        }
    });
}

fn title_from_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= 80 {
        trimmed.to_string()
    } else {
        let clipped: String = trimmed.chars().take(77).collect();
        format!("{clipped}...")
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{clipped}...")
    }
}

/// Persisted history → provider messages. Consecutive same-role messages are
/// merged and the list never starts with an assistant message.
pub(crate) fn history_to_provider_messages(history: &[StoredMessage]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();

    for msg in history {
        let role = match msg.role.as_str() {
            "assistant" => "assistant",
            "user" => "user",
            // System context is rebuilt each turn; in-turn tool messages are
            // captured on the assistant row.
            _ => continue,
        };
        if let Some(last) = messages.last_mut() {
            if last.role == role {
                if let MessageContent::Text(t) = &mut last.content {
                    t.push('\n');
                    t.push_str(&msg.content);
                }
                continue;
            }
        }
        messages.push(Message {
            role: role.into(),
            content: MessageContent::Text(msg.content.clone()),
        });
    }

    while messages.first().map(|m| m.role.as_str()) == Some("assistant") {
        messages.remove(0);
    }

    messages
}

pub(crate) fn build_system_prompt(assistant_name: &str, memory_context: &str) -> String {
    let mut prompt = format!(
        r#"You are {assistant_name}, an assistant for an inventory management system. You answer questions about devices and stock, and you can execute approved write actions.

You have access to these capabilities:
- Search the inventory (inventory_search) and look up device status (device_status)
- Adjust stock levels (adjust_stock) and assign devices (assign_device)
- Retire devices permanently (retire_device) — destructive, requires user approval

Ground every answer in tool results; never invent stock numbers or device states. When a write action fails with a conflict, re-read the current state with a read tool before retrying. Be concise.
"#
    );

    if !memory_context.is_empty() {
        prompt.push_str("\n# Things you remember about this user\n\n");
        prompt.push_str(memory_context);
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(role: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id: 0,
            conversation_id: 1,
            role: role.into(),
            content: content.into(),
            thinking_summary: None,
            tool_calls: None,
            embedding_model: None,
            embedding_status: "pending".into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_history_merges_consecutive_roles() {
        let history = vec![
            stored("user", "hello"),
            stored("user", "anyone there?"),
            stored("assistant", "yes"),
        ];
        let messages = history_to_provider_messages(&history);
        assert_eq!(messages.len(), 2);
        match &messages[0].content {
            MessageContent::Text(t) => assert_eq!(t, "hello\nanyone there?"),
            _ => panic!("Expected Text"),
        }
    }

    #[test]
    fn test_history_never_starts_with_assistant() {
        let history = vec![stored("assistant", "orphan"), stored("user", "hi")];
        let messages = history_to_provider_messages(&history);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_history_skips_non_chat_roles() {
        let history = vec![
            stored("system", "internal"),
            stored("tool", "result"),
            stored("user", "hi"),
        ];
        let messages = history_to_provider_messages(&history);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_title_from_text_truncates() {
        assert_eq!(title_from_text("  short  "), "short");
        let long = "x".repeat(200);
        let title = title_from_text(&long);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_system_prompt_mentions_tools_and_memories() {
        let prompt = build_system_prompt("StockPilot", "<relevant_memories>x</relevant_memories>");
        assert!(prompt.contains("inventory_search"));
        assert!(prompt.contains("retire_device"));
        assert!(prompt.contains("<relevant_memories>"));

        let bare = build_system_prompt("StockPilot", "");
        assert!(!bare.contains("Things you remember"));
    }

    #[tokio::test]
    async fn test_confirmation_hub_roundtrip() {
        let hub = ConfirmationHub::new();
        let rx = hub.register("c1").await;
        assert!(hub.resolve("c1", true).await);
        assert_eq!(rx.await.unwrap(), true);

        // Second resolve for the same id is a no-op.
        assert!(!hub.resolve("c1", false).await);
        // Unknown id likewise.
        assert!(!hub.resolve("missing", true).await);
    }

    #[tokio::test]
    async fn test_confirmation_hub_discard_denies() {
        let hub = ConfirmationHub::new();
        let rx = hub.register("c2").await;
        hub.discard("c2").await;
        // Receiver observes a closed channel, which callers treat as denial.
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_client_error_text_is_generic() {
        for class in [
            ErrorClass::Recoverable,
            ErrorClass::Fatal,
            ErrorClass::Timeout,
            ErrorClass::RateLimit,
        ] {
            let text = client_error_text(class);
            assert!(!text.contains("sql"), "no internals leak: {text}");
            assert!(!text.is_empty());
        }
    }
}
