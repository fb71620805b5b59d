pub mod breaker;
pub mod device;
pub mod query;

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::config::Config;
use crate::llm_types::ToolDefinition;
use breaker::CircuitBreaker;
use device::{DeviceBackend, IdempotentExecutor, WriteTool};
use query::{QueryBackend, ReadTool};
use stockpilot_storage::db::Database;

/// Read tools go to the query collaborator behind the circuit breaker; write
/// tools go through the audited idempotent executor. Destructive writes
/// additionally require a confirmation round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Write { requires_confirmation: bool },
}

/// Caller identity and per-request metadata stamped onto every dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub tenant_id: String,
    pub user_id: String,
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    pub error_type: Option<String>,
    pub duration_ms: Option<u128>,
}

impl ToolResult {
    pub fn success(content: String) -> Self {
        ToolResult {
            content,
            is_error: false,
            error_type: None,
            duration_ms: None,
        }
    }

    pub fn error(content: String) -> Self {
        ToolResult {
            content,
            is_error: true,
            error_type: None,
            duration_ms: None,
        }
    }

    pub fn with_error_type(mut self, error_type: &str) -> Self {
        self.error_type = Some(error_type.to_string());
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ToolKind;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: serde_json::Value, ctx: &ToolCallContext) -> ToolResult;
}

pub fn schema_object(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    cached_definitions: OnceLock<Vec<ToolDefinition>>,
    tool_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(
        config: &Config,
        query_backend: Arc<dyn QueryBackend>,
        device_backend: Arc<dyn DeviceBackend>,
        db: Arc<Database>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));
        let executor = Arc::new(IdempotentExecutor::new(db));

        let tools: Vec<Box<dyn Tool>> = vec![
            Box::new(ReadTool::inventory_search(
                query_backend.clone(),
                breaker.clone(),
            )),
            Box::new(ReadTool::device_status(query_backend, breaker)),
            Box::new(WriteTool::adjust_stock(
                device_backend.clone(),
                executor.clone(),
            )),
            Box::new(WriteTool::assign_device(
                device_backend.clone(),
                executor.clone(),
            )),
            Box::new(WriteTool::retire_device(device_backend, executor)),
        ];

        ToolRegistry {
            tools,
            cached_definitions: OnceLock::new(),
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
        }
    }

    /// Registry over an arbitrary tool set; used by tests.
    pub fn from_tools(tools: Vec<Box<dyn Tool>>, tool_timeout: Duration) -> Self {
        ToolRegistry {
            tools,
            cached_definitions: OnceLock::new(),
            tool_timeout,
        }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        self.cached_definitions
            .get_or_init(|| self.tools.iter().map(|t| t.definition()).collect())
    }

    pub fn kind_of(&self, name: &str) -> Option<ToolKind> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.kind())
    }

    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolCallContext,
    ) -> ToolResult {
        for tool in &self.tools {
            if tool.name() == name {
                let started = Instant::now();
                let mut result =
                    match tokio::time::timeout(self.tool_timeout, tool.execute(input, ctx)).await {
                        Ok(result) => result,
                        Err(_) => ToolResult::error(format!(
                            "Tool '{name}' exceeded its {}s deadline",
                            self.tool_timeout.as_secs()
                        ))
                        .with_error_type("timeout"),
                    };
                result.duration_ms = Some(started.elapsed().as_millis());
                if result.is_error && result.error_type.is_none() {
                    result.error_type = Some("tool_error".to_string());
                }
                return result;
            }
        }
        ToolResult::error(format!("Unknown tool: {name}")).with_error_type("unknown_tool")
    }
}
