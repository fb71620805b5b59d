//! End-to-end turn scenarios: a scripted chat provider and mock query/device
//! collaborators drive the orchestrator through the full event protocol.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use tokio::sync::{mpsc, watch};

use stockpilot::config::Config;
use stockpilot::db::Database;
use stockpilot::error::StockPilotError;
use stockpilot::events::{EventKind, StreamEvent};
use stockpilot::llm::ChatProvider;
use stockpilot::llm_types::{
    Message, MessagesResponse, ProviderDelta, ResponseContentBlock, ToolDefinition,
};
use stockpilot::orchestrator::{run_turn, ConfirmationHub, TurnPhase, TurnRequest};
use stockpilot::redactor::Redactor;
use stockpilot::runtime::{AppState, TurnGate};
use stockpilot::ticket::TicketStore;
use stockpilot::tools::breaker::CircuitBreaker;
use stockpilot::tools::device::{DeviceBackend, IdempotentExecutor, WriteTool};
use stockpilot::tools::query::{QueryBackend, ReadTool};
use stockpilot::tools::{Tool, ToolCallContext, ToolRegistry};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct ScriptedStep {
    thinking: Option<String>,
    response: MessagesResponse,
    hang_ms: u64,
}

struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<ScriptedStep>) -> Self {
        ScriptedProvider {
            steps: Mutex::new(steps.into()),
        }
    }
}

fn text_response(text: &str) -> MessagesResponse {
    MessagesResponse {
        content: vec![ResponseContentBlock::Text { text: text.into() }],
        stop_reason: Some("end_turn".into()),
        usage: None,
    }
}

fn tool_use_response(id: &str, name: &str, input: serde_json::Value) -> MessagesResponse {
    MessagesResponse {
        content: vec![ResponseContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: Some("tool_use".into()),
        usage: None,
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn send_message(
        &self,
        _system: &str,
        _messages: Vec<Message>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        // Only the fact extractor uses this path in these tests.
        Ok(text_response("[]"))
    }

    async fn send_message_stream(
        &self,
        _system: &str,
        _messages: Vec<Message>,
        _tools: Option<Vec<ToolDefinition>>,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted provider ran out of steps");
        if let Some(tx) = delta_tx {
            if let Some(thinking) = &step.thinking {
                let _ = tx.send(ProviderDelta::Thinking(thinking.clone())).await;
            }
            for block in &step.response.content {
                if let ResponseContentBlock::Text { text } = block {
                    let _ = tx.send(ProviderDelta::Text(text.clone())).await;
                }
            }
        }
        if step.hang_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.hang_ms)).await;
        }
        Ok(step.response)
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}

struct MockQueryBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl QueryBackend for MockQueryBackend {
    async fn query(
        &self,
        tool_name: &str,
        _arguments: &serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<serde_json::Value, StockPilotError> {
        assert!(!ctx.correlation_id.is_empty());
        assert_eq!(ctx.tenant_id, "acme");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"tool": tool_name, "device_id": "dev-7", "status": "online"}))
    }
}

struct MockDeviceBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl DeviceBackend for MockDeviceBackend {
    async fn execute(
        &self,
        action: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, StockPilotError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true, "action": action, "execution": n}))
    }
}

struct TestHarness {
    state: Arc<AppState>,
    query_calls: Arc<MockQueryBackend>,
    device_calls: Arc<MockDeviceBackend>,
    dir: std::path::PathBuf,
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn build_harness(steps: Vec<ScriptedStep>) -> TestHarness {
    build_harness_with(steps, true)
}

fn build_harness_with(steps: Vec<ScriptedStep>, with_chat: bool) -> TestHarness {
    let mut config = Config::from_yaml("{}").unwrap();
    // Keep turns deterministic: no background extraction call after persist.
    config.extraction_enabled = false;
    config.confirmation_timeout_secs = 5;

    let dir = std::env::temp_dir().join(format!("sp_turn_flow_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = Arc::new(Database::new(dir.to_str().unwrap()).unwrap());

    let query_backend = Arc::new(MockQueryBackend {
        calls: AtomicUsize::new(0),
    });
    let device_backend = Arc::new(MockDeviceBackend {
        calls: AtomicUsize::new(0),
    });

    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
    let executor = Arc::new(IdempotentExecutor::new(db.clone()));
    let tools: Vec<Box<dyn Tool>> = vec![
        Box::new(ReadTool::inventory_search(
            query_backend.clone(),
            breaker.clone(),
        )),
        Box::new(ReadTool::device_status(query_backend.clone(), breaker)),
        Box::new(WriteTool::adjust_stock(
            device_backend.clone(),
            executor.clone(),
        )),
        Box::new(WriteTool::retire_device(device_backend.clone(), executor)),
    ];
    let registry = ToolRegistry::from_tools(tools, Duration::from_secs(10));

    let state = Arc::new(AppState {
        tickets: TicketStore::new(config.ticket_ttl_secs, config.ticket_skew_secs),
        config,
        db,
        chat: if with_chat {
            Some(Arc::new(ScriptedProvider::new(steps)))
        } else {
            None
        },
        embedding: None,
        tools: registry,
        redactor: Redactor::with_default_rules(),
        confirmations: ConfirmationHub::new(),
        turn_gate: TurnGate::new(),
    });

    TestHarness {
        state,
        query_calls: query_backend,
        device_calls: device_backend,
        dir,
    }
}

fn request(text: &str, conversation_id: Option<i64>, key: Option<&str>) -> TurnRequest {
    TurnRequest {
        tenant_id: "acme".into(),
        user_id: "u1".into(),
        conversation_id,
        text: text.into(),
        idempotency_key: key.map(|k| k.to_string()),
    }
}

async fn collect_turn(
    harness: &TestHarness,
    req: TurnRequest,
) -> (Vec<StreamEvent>, stockpilot::orchestrator::TurnOutcome) {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);
    let outcome = run_turn(&harness.state, req, &tx, &mut cancel_rx).await;
    drop(tx);
    let mut events = Vec::new();
    while let Some(evt) = rx.recv().await {
        events.push(evt);
    }
    (events, outcome)
}

fn assert_contiguous_sequence(events: &[StreamEvent]) {
    for (i, evt) in events.iter().enumerate() {
        assert_eq!(
            evt.sequence, i as u64,
            "sequence gap at index {i}: {:?}",
            evt.kind
        );
    }
    let ids: HashSet<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids.len(), events.len(), "event ids must be unique");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// "what's the status of device X" → read tool → text summary → done.
/// Read tools are not audited, and the thinking summary is redacted.
#[tokio::test]
async fn read_tool_turn_end_to_end() {
    let harness = build_harness(vec![
        ScriptedStep {
            thinking: Some(
                "Need device state. The service key is sk-abc123def456ghi789jkl by the way.".into(),
            ),
            response: tool_use_response("tu_1", "device_status", json!({"device_id": "dev-7"})),
            hang_ms: 0,
        },
        ScriptedStep {
            thinking: None,
            response: text_response("Device dev-7 is online."),
            hang_ms: 0,
        },
    ]);

    let (events, outcome) = collect_turn(
        &harness,
        request("what's the status of device dev-7?", None, None),
    )
    .await;

    assert_eq!(outcome.phase, TurnPhase::Done);
    assert_eq!(outcome.assistant_text, "Device dev-7 is online.");
    assert_contiguous_sequence(&events);

    // done terminates the successful turn
    assert_eq!(events.last().unwrap().kind, EventKind::Done);

    // every tool_call_start has exactly one matching tool_call_end
    let starts: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ToolCallStart)
        .collect();
    let ends: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ToolCallEnd)
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(ends.len(), 1);
    assert_eq!(starts[0].tool_call_id, ends[0].tool_call_id);
    assert_eq!(starts[0].tool_call_id.as_deref(), Some("tu_1"));

    // the tool result reached the stream
    let result_evt = events
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    assert!(result_evt.data.as_ref().unwrap()["content"]
        .as_str()
        .unwrap()
        .contains("online"));

    // thinking deltas were redacted before leaving the orchestrator
    for evt in events.iter().filter(|e| e.kind == EventKind::ThinkingDelta) {
        let delta = evt.data.as_ref().unwrap()["delta"].as_str().unwrap();
        assert!(!delta.contains("sk-abc123def456ghi789jkl"));
    }

    // read tools are never audited
    assert_eq!(
        harness.state.db.count_audits_for_tenant("acme").unwrap(),
        0
    );
    assert_eq!(harness.query_calls.calls.load(Ordering::SeqCst), 1);

    // persisted transcript: user + assistant, count bumped, redacted summary
    let conversation_id = outcome.conversation_id.unwrap();
    let conv = harness
        .state
        .db
        .get_conversation(conversation_id, "acme", "u1")
        .unwrap()
        .unwrap();
    assert_eq!(conv.message_count, 2);

    let messages = harness
        .state
        .db
        .get_recent_messages(conversation_id, 10)
        .unwrap();
    assert_eq!(messages.len(), 2);
    let assistant = &messages[1];
    assert_eq!(assistant.role, "assistant");
    let summary = assistant.thinking_summary.as_deref().unwrap();
    assert!(!summary.contains("sk-abc123def456ghi789jkl"));
    assert!(summary.contains("[redacted-key]"));
    assert!(assistant.tool_calls.is_some());

    // both new messages got embedding jobs
    assert_eq!(harness.state.db.count_embedding_jobs("pending").unwrap(), 2);
}

/// The same write submitted twice with one idempotency key: one side effect,
/// one audit record, identical results.
#[tokio::test]
async fn idempotent_write_turn_end_to_end() {
    let adjust = || {
        vec![
            ScriptedStep {
                thinking: None,
                response: tool_use_response(
                    "tu_w",
                    "adjust_stock",
                    json!({"item_id": "itm-1", "delta": 5}),
                ),
                hang_ms: 0,
            },
            ScriptedStep {
                thinking: None,
                response: text_response("Stock adjusted."),
                hang_ms: 0,
            },
        ]
    };
    let mut steps = adjust();
    steps.extend(adjust());
    let harness = build_harness(steps);

    let (events_a, outcome_a) = collect_turn(
        &harness,
        request("add 5 units to itm-1", None, Some("abc")),
    )
    .await;
    let conversation_id = outcome_a.conversation_id;
    let (events_b, outcome_b) = collect_turn(
        &harness,
        request("add 5 units to itm-1", conversation_id, Some("abc")),
    )
    .await;

    assert_eq!(outcome_a.phase, TurnPhase::Done);
    assert_eq!(outcome_b.phase, TurnPhase::Done);
    assert_contiguous_sequence(&events_a);
    assert_contiguous_sequence(&events_b);

    // exactly one underlying side effect
    assert_eq!(harness.device_calls.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.state.db.count_audits_for_key("acme", "abc").unwrap(), 1);

    // identical result payloads on the wire
    let result_of = |events: &[StreamEvent]| {
        events
            .iter()
            .find(|e| e.kind == EventKind::ToolResult)
            .unwrap()
            .data
            .as_ref()
            .unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string()
    };
    assert_eq!(result_of(&events_a), result_of(&events_b));

    let record = harness
        .state
        .db
        .find_audit_by_key("acme", "abc")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, "completed");
}

/// A destructive tool suspends on confirmation; denial resolves the call as
/// "user declined" without touching the device backend.
#[tokio::test]
async fn confirmation_denied_skips_execution() {
    let harness = build_harness(vec![
        ScriptedStep {
            thinking: None,
            response: tool_use_response("tu_r", "retire_device", json!({"device_id": "dev-9"})),
            hang_ms: 0,
        },
        ScriptedStep {
            thinking: None,
            response: text_response("Understood, the device stays."),
            hang_ms: 0,
        },
    ]);

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let state = harness.state.clone();
    let turn = tokio::spawn(async move {
        let mut cancel_rx = cancel_rx;
        run_turn(
            &state,
            request("retire device dev-9", None, None),
            &tx,
            &mut cancel_rx,
        )
        .await
    });

    let mut events = Vec::new();
    let mut confirmation_id = None;
    while let Some(evt) = rx.recv().await {
        if evt.kind == EventKind::ConfirmationRequired {
            confirmation_id = evt.confirmation_id.clone();
            harness
                .state
                .confirmations
                .resolve(confirmation_id.as_deref().unwrap(), false)
                .await;
        }
        events.push(evt);
    }
    let outcome = turn.await.unwrap();

    assert_eq!(outcome.phase, TurnPhase::Done);
    assert_contiguous_sequence(&events);
    assert_eq!(harness.device_calls.calls.load(Ordering::SeqCst), 0);

    // confirmation_required and confirmation_response share the id
    let response_evt = events
        .iter()
        .find(|e| e.kind == EventKind::ConfirmationResponse)
        .unwrap();
    assert_eq!(response_evt.confirmation_id, confirmation_id);
    assert_eq!(response_evt.data.as_ref().unwrap()["approved"], false);

    // the denial is a successful tool call whose result says so
    let result_evt = events
        .iter()
        .find(|e| e.kind == EventKind::ToolResult)
        .unwrap();
    let data = result_evt.data.as_ref().unwrap();
    assert_eq!(data["is_error"], false);
    assert!(data["content"].as_str().unwrap().contains("declined"));
}

/// An approved confirmation executes the destructive write.
#[tokio::test]
async fn confirmation_approved_executes() {
    let harness = build_harness(vec![
        ScriptedStep {
            thinking: None,
            response: tool_use_response("tu_r", "retire_device", json!({"device_id": "dev-9"})),
            hang_ms: 0,
        },
        ScriptedStep {
            thinking: None,
            response: text_response("Device dev-9 retired."),
            hang_ms: 0,
        },
    ]);

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let state = harness.state.clone();
    let turn = tokio::spawn(async move {
        let mut cancel_rx = cancel_rx;
        run_turn(
            &state,
            request("retire device dev-9", None, None),
            &tx,
            &mut cancel_rx,
        )
        .await
    });

    while let Some(evt) = rx.recv().await {
        if evt.kind == EventKind::ConfirmationRequired {
            harness
                .state
                .confirmations
                .resolve(evt.confirmation_id.as_deref().unwrap(), true)
                .await;
        }
    }
    let outcome = turn.await.unwrap();

    assert_eq!(outcome.phase, TurnPhase::Done);
    assert_eq!(harness.device_calls.calls.load(Ordering::SeqCst), 1);
    // writes are audited even without an idempotency key
    assert_eq!(harness.state.db.count_audits_for_tenant("acme").unwrap(), 1);
}

/// Client cancel mid-generation: partial text is committed to the transcript
/// but embedding jobs are not enqueued.
#[tokio::test]
async fn cancellation_persists_partial_transcript() {
    let harness = build_harness(vec![ScriptedStep {
        thinking: None,
        response: text_response("Counting the shelves now..."),
        hang_ms: 30_000,
    }]);

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let state = harness.state.clone();
    let turn = tokio::spawn(async move {
        let mut cancel_rx = cancel_rx;
        run_turn(
            &state,
            request("count everything", None, None),
            &tx,
            &mut cancel_rx,
        )
        .await
    });

    let mut events = Vec::new();
    while let Some(evt) = rx.recv().await {
        if evt.kind == EventKind::TextDelta {
            // the provider is now hanging; cancel the turn
            let _ = cancel_tx.send(true);
        }
        events.push(evt);
    }
    let outcome = turn.await.unwrap();

    assert_eq!(outcome.phase, TurnPhase::Cancelled);
    assert_eq!(events.last().unwrap().kind, EventKind::Cancel);
    assert_contiguous_sequence(&events);

    let conversation_id = outcome.conversation_id.unwrap();
    let messages = harness
        .state
        .db
        .get_recent_messages(conversation_id, 10)
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Counting the shelves now...");
    assert_eq!(messages[1].embedding_status, "pending");
    // no jobs were enqueued for the cancelled turn
    assert_eq!(harness.state.db.count_embedding_jobs("pending").unwrap(), 0);
}

/// With no provider chain the turn reports a fatal error instead of hanging.
#[tokio::test]
async fn missing_provider_reports_unavailable() {
    let harness = build_harness_with(vec![], false);
    let (events, outcome) = collect_turn(&harness, request("hello?", None, None)).await;

    assert_eq!(outcome.phase, TurnPhase::Error);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(
        events[0].error_type,
        Some(stockpilot::error::ErrorClass::Fatal)
    );
}

/// A conversation id from another tenant behaves as if it does not exist.
#[tokio::test]
async fn cross_tenant_conversation_is_invisible() {
    let harness = build_harness(vec![ScriptedStep {
        thinking: None,
        response: text_response("hi"),
        hang_ms: 0,
    }]);
    let foreign = harness
        .state
        .db
        .create_conversation("globex", "other", None)
        .unwrap();

    let (events, outcome) = collect_turn(&harness, request("hello", Some(foreign), None)).await;
    assert_eq!(outcome.phase, TurnPhase::Error);
    assert_eq!(events.last().unwrap().kind, EventKind::Error);
}

/// Turn N+1 sees turn N's messages: persistence happens-before the next
/// context load on the same conversation.
#[tokio::test]
async fn sequential_turns_accumulate_history() {
    let harness = build_harness(vec![
        ScriptedStep {
            thinking: None,
            response: text_response("First answer."),
            hang_ms: 0,
        },
        ScriptedStep {
            thinking: None,
            response: text_response("Second answer."),
            hang_ms: 0,
        },
    ]);

    let (_, outcome_a) = collect_turn(&harness, request("first question", None, None)).await;
    let conversation_id = outcome_a.conversation_id;
    let (_, outcome_b) =
        collect_turn(&harness, request("second question", conversation_id, None)).await;

    assert_eq!(outcome_a.conversation_id, outcome_b.conversation_id);
    let conv = harness
        .state
        .db
        .get_conversation(conversation_id.unwrap(), "acme", "u1")
        .unwrap()
        .unwrap();
    assert_eq!(conv.message_count, 4);
}
