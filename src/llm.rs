use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use crate::config::{ChatProviderConfig, Config};
use crate::error::StockPilotError;
use crate::llm_types::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, ProviderDelta,
    ResponseContentBlock, ToolDefinition, Usage,
};

/// Remove orphaned `ToolResult` blocks whose `tool_use_id` does not match any
/// `ToolUse` block in the conversation.
fn sanitize_messages(messages: Vec<Message>) -> Vec<Message> {
    let known_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| match &m.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => vec![],
        })
        .collect();

    messages
        .into_iter()
        .filter_map(|msg| {
            if msg.role != "user" {
                return Some(msg);
            }
            match msg.content {
                MessageContent::Blocks(blocks) => {
                    let filtered: Vec<ContentBlock> = blocks
                        .into_iter()
                        .filter(|b| match b {
                            ContentBlock::ToolResult { tool_use_id, .. } => {
                                known_ids.contains(tool_use_id)
                            }
                            _ => true,
                        })
                        .collect();
                    if filtered.is_empty() {
                        None
                    } else {
                        Some(Message {
                            role: msg.role,
                            content: MessageContent::Blocks(filtered),
                        })
                    }
                }
                other => Some(Message {
                    role: msg.role,
                    content: other,
                }),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Provider trait and fallback chain
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, StockPilotError>;

    /// Streaming variant: text and thinking deltas are pushed through
    /// `delta_tx` while the call is in flight; the assembled response is
    /// returned at the end. The bounded sender gives backpressure — the
    /// provider task suspends when the consumer falls behind.
    async fn send_message_stream(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<MessagesResponse, StockPilotError>;

    fn model_name(&self) -> &str;
}

/// Walk the configured fallback chain once, at startup. A provider that
/// cannot initialize is skipped with a logged reason; an empty result means
/// the assistant feature is unavailable (the rest of the service still runs).
pub fn create_chat_chain(config: &Config) -> Option<Arc<dyn ChatProvider>> {
    for entry in &config.chat_providers {
        match build_chat_provider(entry, config) {
            Ok(provider) => {
                info!(
                    kind = %entry.kind,
                    model = %entry.model,
                    "Selected chat provider"
                );
                return Some(provider);
            }
            Err(reason) => {
                warn!(kind = %entry.kind, %reason, "Skipping chat provider");
            }
        }
    }
    None
}

fn build_chat_provider(
    entry: &ChatProviderConfig,
    config: &Config,
) -> Result<Arc<dyn ChatProvider>, String> {
    let timeout = Duration::from_secs(config.provider_timeout_secs);
    match entry.kind.as_str() {
        "anthropic" => {
            if entry.api_key.trim().is_empty() {
                return Err("missing api_key".into());
            }
            Ok(Arc::new(AnthropicProvider::new(
                entry,
                config.max_tokens,
                timeout,
            )))
        }
        "openai" => {
            if entry.api_key.trim().is_empty() && entry.base_url.is_none() {
                return Err("missing api_key and base_url".into());
            }
            Ok(Arc::new(OpenAiProvider::new(
                entry,
                config.max_tokens,
                timeout,
            )))
        }
        other => Err(format!("unknown provider kind: {other}")),
    }
}

async fn send_delta(delta_tx: Option<&Sender<ProviderDelta>>, delta: ProviderDelta) {
    if let Some(tx) = delta_tx {
        let _ = tx.send(delta).await;
    }
}

// ---------------------------------------------------------------------------
// SSE plumbing
// ---------------------------------------------------------------------------

/// Splits a byte stream into complete SSE events at `\n\n` boundaries,
/// buffering partial events across chunk reads.
pub(crate) struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    pub(crate) fn new() -> Self {
        SseBuffer {
            buffer: String::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let event = self.buffer[..end].to_string();
            self.buffer = self.buffer[end + 2..].to_string();
            if !event.trim().is_empty() {
                events.push(event);
            }
        }
        events
    }

    pub(crate) fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Extract the payloads of `data:` lines from one SSE event.
pub(crate) fn sse_data_lines(event: &str) -> Vec<String> {
    event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Anthropic provider
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(entry: &ChatProviderConfig, max_tokens: u32, timeout: Duration) -> Self {
        AnthropicProvider {
            http: reqwest::Client::new(),
            api_key: entry.api_key.clone(),
            model: entry.model.clone(),
            max_tokens,
            base_url: entry
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into()),
            timeout,
        }
    }

    async fn request_with_retry(
        &self,
        request: &MessagesRequest,
    ) -> Result<reqwest::Response, StockPilotError> {
        let mut retries = 0u32;
        let max_retries = 3;

        loop {
            let response = self
                .http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(request)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status.as_u16() == 429 {
                if retries < max_retries {
                    retries += 1;
                    let delay = Duration::from_secs(2u64.pow(retries));
                    warn!(
                        "Rate limited, retrying in {:?} (attempt {retries}/{max_retries})",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(StockPilotError::RateLimited);
            }

            let body = response.text().await.unwrap_or_default();
            if let Ok(api_err) = serde_json::from_str::<AnthropicApiError>(&body) {
                return Err(StockPilotError::LlmApi(format!(
                    "{}: {}",
                    api_err.error.error_type, api_err.error.message
                )));
            }
            return Err(StockPilotError::LlmApi(format!("HTTP {status}: {body}")));
        }
    }

    async fn stream_response(
        &self,
        request: &MessagesRequest,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let response = self.request_with_retry(request).await?;

        let mut byte_stream = response.bytes_stream();
        let mut buffer = SseBuffer::new();
        let mut assembler = AnthropicStreamAssembler::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk?;
            let text = String::from_utf8_lossy(&bytes);
            for event in buffer.push(&text) {
                for data in sse_data_lines(&event) {
                    assembler.apply(&data, delta_tx).await?;
                }
            }
        }
        if let Some(event) = buffer.flush() {
            for data in sse_data_lines(&event) {
                assembler.apply(&data, delta_tx).await?;
            }
        }

        Ok(assembler.finish())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicApiError {
    error: AnthropicApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    content_block: Option<AnthropicContentBlockStart>,
    #[serde(default)]
    delta: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<AnthropicApiErrorDetail>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockStart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

enum PendingBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
}

/// Accumulates Anthropic stream events into a `MessagesResponse`, forwarding
/// text/thinking deltas as they arrive.
struct AnthropicStreamAssembler {
    blocks: Vec<PendingBlock>,
    stop_reason: Option<String>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl AnthropicStreamAssembler {
    fn new() -> Self {
        AnthropicStreamAssembler {
            blocks: Vec::new(),
            stop_reason: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    async fn apply(
        &mut self,
        data: &str,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<(), StockPilotError> {
        let event: AnthropicStreamEvent = serde_json::from_str(data)
            .map_err(|e| StockPilotError::LlmApi(format!("bad stream event: {e} (data: {data})")))?;

        match event.kind.as_str() {
            "message_start" => {
                if let Some(tokens) = event
                    .message
                    .as_ref()
                    .and_then(|m| m["usage"]["input_tokens"].as_u64())
                {
                    self.input_tokens = Some(tokens as u32);
                }
            }
            "content_block_start" => {
                let start = event.content_block.ok_or_else(|| {
                    StockPilotError::LlmApi("content_block_start without block".into())
                })?;
                let block = match start.kind.as_str() {
                    "tool_use" => PendingBlock::ToolUse {
                        id: start.id.unwrap_or_default(),
                        name: start.name.unwrap_or_default(),
                        partial_json: String::new(),
                    },
                    "thinking" => PendingBlock::Thinking(String::new()),
                    _ => PendingBlock::Text(String::new()),
                };
                let index = event.index.unwrap_or(self.blocks.len());
                while self.blocks.len() <= index {
                    self.blocks.push(PendingBlock::Text(String::new()));
                }
                self.blocks[index] = block;
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return Ok(());
                };
                let index = event.index.unwrap_or(0);
                if index >= self.blocks.len() {
                    return Ok(());
                }
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if let PendingBlock::Text(acc) = &mut self.blocks[index] {
                            acc.push_str(text);
                        }
                        send_delta(delta_tx, ProviderDelta::Text(text.to_string())).await;
                    }
                    Some("thinking_delta") => {
                        let text = delta["thinking"].as_str().unwrap_or_default();
                        if let PendingBlock::Thinking(acc) = &mut self.blocks[index] {
                            acc.push_str(text);
                        }
                        send_delta(delta_tx, ProviderDelta::Thinking(text.to_string())).await;
                    }
                    Some("input_json_delta") => {
                        let fragment = delta["partial_json"].as_str().unwrap_or_default();
                        if let PendingBlock::ToolUse { partial_json, .. } = &mut self.blocks[index]
                        {
                            partial_json.push_str(fragment);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(delta) = event.delta {
                    if let Some(reason) = delta["stop_reason"].as_str() {
                        self.stop_reason = Some(reason.to_string());
                    }
                }
                if let Some(tokens) = event
                    .usage
                    .as_ref()
                    .and_then(|u| u["output_tokens"].as_u64())
                {
                    self.output_tokens = Some(tokens as u32);
                }
            }
            "error" => {
                let detail = event
                    .error
                    .map(|e| format!("{}: {}", e.error_type, e.message))
                    .unwrap_or_else(|| "unknown stream error".into());
                return Err(StockPilotError::LlmApi(detail));
            }
            // ping, content_block_stop, message_stop need no handling
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> MessagesResponse {
        let mut content = Vec::new();
        for block in self.blocks {
            match block {
                PendingBlock::Text(text) => {
                    if !text.is_empty() {
                        content.push(ResponseContentBlock::Text { text });
                    }
                }
                PendingBlock::Thinking(thinking) => {
                    if !thinking.is_empty() {
                        content.push(ResponseContentBlock::Thinking { thinking });
                    }
                }
                PendingBlock::ToolUse {
                    id,
                    name,
                    partial_json,
                } => {
                    let input = if partial_json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&partial_json).unwrap_or_else(|_| json!({}))
                    };
                    content.push(ResponseContentBlock::ToolUse { id, name, input });
                }
            }
        }
        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        let usage = match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(Usage {
                input_tokens: i.unwrap_or(0),
                output_tokens: o.unwrap_or(0),
            }),
        };

        MessagesResponse {
            content,
            stop_reason: self.stop_reason.or_else(|| Some("end_turn".into())),
            usage,
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            messages: sanitize_messages(messages),
            tools,
            stream: false,
        };

        let fut = async {
            let response = self.request_with_retry(&request).await?;
            let body = response.text().await?;
            serde_json::from_str::<MessagesResponse>(&body).map_err(|e| {
                StockPilotError::LlmApi(format!("Failed to parse response: {e}\nBody: {body}"))
            })
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StockPilotError::Timeout("chat provider call".into()))?
    }

    async fn send_message_stream(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            messages: sanitize_messages(messages),
            tools,
            stream: true,
        };

        tokio::time::timeout(self.timeout, self.stream_response(&request, delta_tx))
            .await
            .map_err(|_| StockPilotError::Timeout("chat provider stream".into()))?
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider  (OpenAI, OpenRouter, local servers via base_url)
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    chat_url: String,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(entry: &ChatProviderConfig, max_tokens: u32, timeout: Duration) -> Self {
        let base = entry.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
        let chat_url = format!("{}/chat/completions", base.trim_end_matches('/'));

        OpenAiProvider {
            http: reqwest::Client::new(),
            api_key: entry.api_key.clone(),
            model: entry.model.clone(),
            max_tokens,
            chat_url,
            timeout,
        }
    }

    async fn request_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, StockPilotError> {
        let mut retries = 0u32;
        let max_retries = 3;

        loop {
            let mut req = self
                .http
                .post(&self.chat_url)
                .header("Content-Type", "application/json")
                .json(body);
            if !self.api_key.trim().is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }
            let response = req.send().await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status.as_u16() == 429 {
                if retries < max_retries {
                    retries += 1;
                    let delay = Duration::from_secs(2u64.pow(retries));
                    warn!(
                        "Rate limited, retrying in {:?} (attempt {retries}/{max_retries})",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(StockPilotError::RateLimited);
            }

            let text = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<OaiErrorResponse>(&text) {
                return Err(StockPilotError::LlmApi(err.error.message));
            }
            return Err(StockPilotError::LlmApi(format!("HTTP {status}: {text}")));
        }
    }

    fn request_body(
        &self,
        system: &str,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": translate_messages_to_oai(system, messages),
        });
        if let Some(tool_defs) = tools {
            if !tool_defs.is_empty() {
                body["tools"] = json!(translate_tools_to_oai(tool_defs));
            }
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

// --- OpenAI response types ---

#[derive(Debug, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCall {
    id: String,
    function: OaiFunction,
}

#[derive(Debug, Deserialize)]
struct OaiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChunk {
    choices: Vec<OaiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OaiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OaiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates OpenAI stream chunks: content, reasoning, and tool-call
/// fragments keyed by index.
struct OaiStreamAssembler {
    content: String,
    reasoning: String,
    tool_calls: Vec<(u32, Option<String>, String, String)>,
    finish_reason: Option<String>,
}

impl OaiStreamAssembler {
    fn new() -> Self {
        OaiStreamAssembler {
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    async fn apply(
        &mut self,
        data: &str,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<(), StockPilotError> {
        if data == "[DONE]" {
            return Ok(());
        }
        let chunk: OaiStreamChunk = serde_json::from_str(data)
            .map_err(|e| StockPilotError::LlmApi(format!("bad stream chunk: {e} (data: {data})")))?;
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };

        if let Some(text) = &choice.delta.content {
            if !text.is_empty() {
                self.content.push_str(text);
                send_delta(delta_tx, ProviderDelta::Text(text.clone())).await;
            }
        }
        if let Some(text) = &choice.delta.reasoning {
            if !text.is_empty() {
                self.reasoning.push_str(text);
                send_delta(delta_tx, ProviderDelta::Thinking(text.clone())).await;
            }
        }
        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let entry = self.tool_calls.iter_mut().find(|(i, ..)| *i == index);
                match entry {
                    Some((_, id, name, args)) => {
                        if let Some(f) = &tc.function {
                            if let Some(n) = &f.name {
                                name.push_str(n);
                            }
                            if let Some(a) = &f.arguments {
                                args.push_str(a);
                            }
                        }
                        if tc.id.is_some() {
                            *id = tc.id.clone();
                        }
                    }
                    None => {
                        let name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        let args = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.arguments.clone())
                            .unwrap_or_default();
                        self.tool_calls.push((index, tc.id.clone(), name, args));
                    }
                }
            }
        }
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        Ok(())
    }

    fn finish(self) -> MessagesResponse {
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ResponseContentBlock::Thinking {
                thinking: self.reasoning,
            });
        }
        if !self.content.is_empty() {
            content.push(ResponseContentBlock::Text { text: self.content });
        }
        let has_tool_calls = !self.tool_calls.is_empty();
        for (_, id, name, args) in self.tool_calls {
            let input: serde_json::Value = serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
            content.push(ResponseContentBlock::ToolUse {
                id: id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                name,
                input,
            });
        }
        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        let stop_reason = if has_tool_calls {
            Some("tool_use".into())
        } else {
            match self.finish_reason.as_deref() {
                Some("length") => Some("max_tokens".into()),
                _ => Some("end_turn".into()),
            }
        };

        MessagesResponse {
            content,
            stop_reason,
            usage: None,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn send_message(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let messages = sanitize_messages(messages);
        let body = self.request_body(system, &messages, tools.as_deref(), false);

        let fut = async {
            let response = self.request_with_retry(&body).await?;
            let text = response.text().await?;
            let oai: OaiResponse = serde_json::from_str(&text).map_err(|e| {
                StockPilotError::LlmApi(format!("Failed to parse OpenAI response: {e}\nBody: {text}"))
            })?;
            Ok(translate_oai_response(oai))
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StockPilotError::Timeout("chat provider call".into()))?
    }

    async fn send_message_stream(
        &self,
        system: &str,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        delta_tx: Option<&Sender<ProviderDelta>>,
    ) -> Result<MessagesResponse, StockPilotError> {
        let messages = sanitize_messages(messages);
        let body = self.request_body(system, &messages, tools.as_deref(), true);

        let fut = async {
            let response = self.request_with_retry(&body).await?;
            let mut byte_stream = response.bytes_stream();
            let mut buffer = SseBuffer::new();
            let mut assembler = OaiStreamAssembler::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = chunk?;
                let text = String::from_utf8_lossy(&bytes);
                for event in buffer.push(&text) {
                    for data in sse_data_lines(&event) {
                        assembler.apply(&data, delta_tx).await?;
                    }
                }
            }
            if let Some(event) = buffer.flush() {
                for data in sse_data_lines(&event) {
                    assembler.apply(&data, delta_tx).await?;
                }
            }
            Ok(assembler.finish())
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StockPilotError::Timeout("chat provider stream".into()))?
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Format translation helpers  (internal Anthropic-style ↔ OpenAI)
// ---------------------------------------------------------------------------

fn translate_messages_to_oai(system: &str, messages: &[Message]) -> Vec<serde_json::Value> {
    let known_tool_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| match &m.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => vec![],
        })
        .collect();

    let mut out: Vec<serde_json::Value> = Vec::new();

    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }

    for msg in messages {
        match &msg.content {
            MessageContent::Text(text) => {
                out.push(json!({"role": msg.role, "content": text}));
            }
            MessageContent::Blocks(blocks) => {
                if msg.role == "assistant" {
                    let text: String = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("");

                    let tool_calls: Vec<serde_json::Value> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, name, input } => Some(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": serde_json::to_string(input).unwrap_or_default()
                                }
                            })),
                            _ => None,
                        })
                        .collect();

                    let mut m = json!({"role": "assistant"});
                    if !text.is_empty() || tool_calls.is_empty() {
                        m["content"] = json!(text);
                    }
                    if !tool_calls.is_empty() {
                        m["tool_calls"] = json!(tool_calls);
                    }
                    out.push(m);
                } else {
                    let has_tool_results = blocks
                        .iter()
                        .any(|b| matches!(b, ContentBlock::ToolResult { .. }));

                    if has_tool_results {
                        for block in blocks {
                            if let ContentBlock::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            } = block
                            {
                                if !known_tool_ids.contains(tool_use_id.as_str()) {
                                    continue;
                                }
                                let c = if is_error == &Some(true) {
                                    format!("[Error] {content}")
                                } else {
                                    content.clone()
                                };
                                out.push(json!({
                                    "role": "tool",
                                    "tool_call_id": tool_use_id,
                                    "content": c,
                                }));
                            }
                        }
                    } else {
                        let text: String = blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::Text { text } => Some(text.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        out.push(json!({"role": "user", "content": text}));
                    }
                }
            }
        }
    }

    out
}

fn translate_tools_to_oai(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

fn translate_oai_response(oai: OaiResponse) -> MessagesResponse {
    let choice = match oai.choices.into_iter().next() {
        Some(c) => c,
        None => {
            return MessagesResponse {
                content: vec![ResponseContentBlock::Text {
                    text: "(empty response)".into(),
                }],
                stop_reason: Some("end_turn".into()),
                usage: None,
            };
        }
    };

    let mut content = Vec::new();

    if let Some(reasoning) = choice.message.reasoning {
        if !reasoning.is_empty() {
            content.push(ResponseContentBlock::Thinking {
                thinking: reasoning,
            });
        }
    }

    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ResponseContentBlock::Text { text });
        }
    }

    if let Some(tool_calls) = choice.message.tool_calls {
        for tc in tool_calls {
            let input: serde_json::Value =
                serde_json::from_str(&tc.function.arguments).unwrap_or_default();
            content.push(ResponseContentBlock::ToolUse {
                id: tc.id,
                name: tc.function.name,
                input,
            });
        }
    }

    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => Some("tool_use".into()),
        Some("length") => Some("max_tokens".into()),
        _ => Some("end_turn".into()),
    };

    let usage = oai.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    MessagesResponse {
        content,
        stop_reason,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // SSE plumbing
    // -----------------------------------------------------------------------

    #[test]
    fn test_sse_buffer_splits_events() {
        let mut buf = SseBuffer::new();
        let events = buf.push("data: one\n\ndata: two\n\ndata: thr");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "data: one");

        let events = buf.push("ee\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], "data: three");
        assert!(buf.flush().is_none());
    }

    #[test]
    fn test_sse_buffer_flush_returns_remainder() {
        let mut buf = SseBuffer::new();
        assert!(buf.push("data: partial").is_empty());
        assert_eq!(buf.flush().as_deref(), Some("data: partial"));
    }

    #[test]
    fn test_sse_data_lines_skips_other_fields() {
        let lines = sse_data_lines("event: message_start\ndata: {\"a\":1}\n: comment");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    // -----------------------------------------------------------------------
    // Anthropic stream assembly
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_anthropic_assembler_text_and_thinking() {
        let mut asm = AnthropicStreamAssembler::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ProviderDelta>(16);

        asm.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"checking stock"}}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"text"}}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"3 units"}}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        drop(tx);

        let mut deltas = Vec::new();
        while let Some(d) = rx.recv().await {
            deltas.push(d);
        }
        assert!(matches!(&deltas[0], ProviderDelta::Thinking(t) if t == "checking stock"));
        assert!(matches!(&deltas[1], ProviderDelta::Text(t) if t == "3 units"));

        let resp = asm.finish();
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.usage.unwrap().output_tokens, 12);
        assert_eq!(resp.content.len(), 2);
    }

    #[tokio::test]
    async fn test_anthropic_assembler_tool_use_accumulates_json() {
        let mut asm = AnthropicStreamAssembler::new();
        asm.apply(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"device_status"}}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"device_id\":"}}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"dev-7\"}"}}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            None,
        )
        .await
        .unwrap();

        let resp = asm.finish();
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        match &resp.content[0] {
            ResponseContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "device_status");
                assert_eq!(input["device_id"], "dev-7");
            }
            _ => panic!("Expected ToolUse"),
        }
    }

    #[tokio::test]
    async fn test_anthropic_assembler_error_event() {
        let mut asm = AnthropicStreamAssembler::new();
        let err = asm
            .apply(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));
    }

    // -----------------------------------------------------------------------
    // OpenAI stream assembly
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_oai_assembler_content_and_tool_calls() {
        let mut asm = OaiStreamAssembler::new();
        asm.apply(
            r#"{"choices":[{"delta":{"content":"Let me "},"finish_reason":null}]}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"choices":[{"delta":{"content":"check."},"finish_reason":null}]}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"inventory_search","arguments":"{\"query\":"}}]},"finish_reason":null}]}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"router\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            None,
        )
        .await
        .unwrap();
        asm.apply("[DONE]", None).await.unwrap();

        let resp = asm.finish();
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        match &resp.content[0] {
            ResponseContentBlock::Text { text } => assert_eq!(text, "Let me check."),
            _ => panic!("Expected Text"),
        }
        match &resp.content[1] {
            ResponseContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "inventory_search");
                assert_eq!(input["query"], "router");
            }
            _ => panic!("Expected ToolUse"),
        }
    }

    #[tokio::test]
    async fn test_oai_assembler_reasoning_becomes_thinking() {
        let mut asm = OaiStreamAssembler::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ProviderDelta>(4);
        asm.apply(
            r#"{"choices":[{"delta":{"reasoning":"thinking hard"},"finish_reason":null}]}"#,
            Some(&tx),
        )
        .await
        .unwrap();
        drop(tx);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ProviderDelta::Thinking(t) if t == "thinking hard"
        ));
        let resp = asm.finish();
        assert!(matches!(
            &resp.content[0],
            ResponseContentBlock::Thinking { thinking } if thinking == "thinking hard"
        ));
    }

    // -----------------------------------------------------------------------
    // translate helpers (non-streaming path)
    // -----------------------------------------------------------------------

    #[test]
    fn test_translate_messages_system_only() {
        let out = translate_messages_to_oai("You are an inventory assistant.", &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "system");
    }

    #[test]
    fn test_translate_messages_tool_result() {
        let msgs = vec![
            Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "device_status".into(),
                    input: json!({}),
                }]),
            },
            Message {
                role: "user".into(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "online".into(),
                    is_error: None,
                }]),
            },
        ];
        let out = translate_messages_to_oai("", &msgs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["role"], "tool");
        assert_eq!(out[1]["tool_call_id"], "t1");
    }

    #[test]
    fn test_translate_messages_orphaned_tool_result_skipped() {
        let msgs = vec![Message {
            role: "user".into(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "orphan".into(),
                content: "stale".into(),
                is_error: None,
            }]),
        }];
        let out = translate_messages_to_oai("", &msgs);
        assert!(out.is_empty());
    }

    #[test]
    fn test_translate_oai_response_tool_calls() {
        let oai = OaiResponse {
            choices: vec![OaiChoice {
                message: OaiMessage {
                    content: None,
                    reasoning: None,
                    tool_calls: Some(vec![OaiToolCall {
                        id: "call_1".into(),
                        function: OaiFunction {
                            name: "inventory_search".into(),
                            arguments: r#"{"query":"switch"}"#.into(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        };
        let resp = translate_oai_response(oai);
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        match &resp.content[0] {
            ResponseContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "inventory_search");
                assert_eq!(input["query"], "switch");
            }
            _ => panic!("Expected ToolUse"),
        }
    }

    #[test]
    fn test_translate_oai_response_empty_choices() {
        let resp = translate_oai_response(OaiResponse {
            choices: vec![],
            usage: None,
        });
        match &resp.content[0] {
            ResponseContentBlock::Text { text } => assert_eq!(text, "(empty response)"),
            _ => panic!("Expected Text"),
        }
    }

    // -----------------------------------------------------------------------
    // sanitize_messages
    // -----------------------------------------------------------------------

    #[test]
    fn test_sanitize_messages_removes_orphaned_tool_results() {
        let msgs = vec![
            Message {
                role: "assistant".into(),
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "inventory_search".into(),
                    input: json!({}),
                }]),
            },
            Message {
                role: "user".into(),
                content: MessageContent::Blocks(vec![
                    ContentBlock::ToolResult {
                        tool_use_id: "t1".into(),
                        content: "ok".into(),
                        is_error: None,
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: "orphan".into(),
                        content: "stale".into(),
                        is_error: None,
                    },
                ]),
            },
        ];
        let sanitized = sanitize_messages(msgs);
        if let MessageContent::Blocks(blocks) = &sanitized[1].content {
            assert_eq!(blocks.len(), 1);
        } else {
            panic!("Expected Blocks");
        }
    }

    #[test]
    fn test_sanitize_messages_drops_empty_user_message() {
        let msgs = vec![Message {
            role: "user".into(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "orphan".into(),
                content: "stale".into(),
                is_error: None,
            }]),
        }];
        assert!(sanitize_messages(msgs).is_empty());
    }

    // -----------------------------------------------------------------------
    // Fallback chain
    // -----------------------------------------------------------------------

    #[test]
    fn test_chain_skips_unusable_provider() {
        let config = Config::from_yaml(
            r#"
chat_providers:
  - kind: anthropic
  - kind: openai
    api_key: sk-test
"#,
        )
        .unwrap();
        let provider = create_chat_chain(&config).unwrap();
        // Anthropic entry lacks a key and is skipped; OpenAI default model wins.
        assert_eq!(provider.model_name(), "gpt-5.2");
    }

    #[test]
    fn test_chain_empty_when_no_provider_initializes() {
        let config = Config::from_yaml(
            r#"
chat_providers:
  - kind: anthropic
"#,
        )
        .unwrap();
        assert!(create_chat_chain(&config).is_none());
    }

    #[test]
    fn test_chain_local_openai_without_key_is_usable() {
        let config = Config::from_yaml(
            r#"
chat_providers:
  - kind: openai
    base_url: http://127.0.0.1:11434/v1
    model: llama3.2
"#,
        )
        .unwrap();
        let provider = create_chat_chain(&config).unwrap();
        assert_eq!(provider.model_name(), "llama3.2");
    }
}
