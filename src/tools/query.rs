use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::breaker::CircuitBreaker;
use super::{schema_object, Tool, ToolCallContext, ToolKind, ToolResult};
use crate::error::StockPilotError;
use crate::llm_types::ToolDefinition;

/// The external read-only query collaborator. It enforces its own data-level
/// access control; the core stamps identity and correlation onto every call.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<serde_json::Value, StockPilotError>;
}

pub struct HttpQueryBackend {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl HttpQueryBackend {
    pub fn new(base_url: &str, service_token: &str) -> Self {
        HttpQueryBackend {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_token: service_token.to_string(),
        }
    }
}

#[async_trait]
impl QueryBackend for HttpQueryBackend {
    async fn query(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<serde_json::Value, StockPilotError> {
        let url = format!("{}/query/{}", self.base_url, tool_name);
        let mut req = self.http.post(&url).json(&json!({
            "arguments": arguments,
            "correlation_id": ctx.correlation_id,
            "tenant_id": ctx.tenant_id,
            "user_id": ctx.user_id,
        }));
        if !self.service_token.is_empty() {
            req = req.bearer_auth(&self.service_token);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StockPilotError::ToolExecution(format!(
                "query service returned HTTP {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }
}

/// A read tool: forwarded to the query collaborator, guarded by the shared
/// circuit breaker. While the breaker is open the call fails fast.
pub struct ReadTool {
    name: &'static str,
    description: &'static str,
    input_schema: serde_json::Value,
    backend: Arc<dyn QueryBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl ReadTool {
    pub fn inventory_search(backend: Arc<dyn QueryBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        ReadTool {
            name: "inventory_search",
            description: "Search the inventory for items matching a free-text query. \
                          Returns matching items with quantities and locations.",
            input_schema: schema_object(
                json!({
                    "query": {"type": "string", "description": "Free-text search terms"},
                    "limit": {"type": "integer", "description": "Maximum results (default 10)"}
                }),
                &["query"],
            ),
            backend,
            breaker,
        }
    }

    pub fn device_status(backend: Arc<dyn QueryBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        ReadTool {
            name: "device_status",
            description: "Look up the current status of a device by its id: \
                          assignment, location, health, and last check-in.",
            input_schema: schema_object(
                json!({
                    "device_id": {"type": "string", "description": "Device identifier"}
                }),
                &["device_id"],
            ),
            backend,
            breaker,
        }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema.clone(),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolCallContext) -> ToolResult {
        if !self.breaker.try_acquire() {
            warn!(
                tool = self.name,
                correlation_id = %ctx.correlation_id,
                "Query circuit open, failing fast"
            );
            return ToolResult::error(format!(
                "The query service is temporarily unavailable (tool '{}'). Try again shortly.",
                self.name
            ))
            .with_error_type("circuit_open");
        }

        match self.backend.query(self.name, &input, ctx).await {
            Ok(value) => {
                self.breaker.record_success();
                info!(
                    tool = self.name,
                    correlation_id = %ctx.correlation_id,
                    tenant_id = %ctx.tenant_id,
                    "Read tool completed"
                );
                ToolResult::success(value.to_string())
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(
                    tool = self.name,
                    correlation_id = %ctx.correlation_id,
                    error = %e,
                    breaker = self.breaker.state_name(),
                    "Read tool failed"
                );
                ToolResult::error(format!("Query failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl QueryBackend for FlakyBackend {
        async fn query(
            &self,
            _tool_name: &str,
            _arguments: &serde_json::Value,
            _ctx: &ToolCallContext,
        ) -> Result<serde_json::Value, StockPilotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StockPilotError::ToolExecution("boom".into()))
            } else {
                Ok(json!({"items": []}))
            }
        }
    }

    fn ctx() -> ToolCallContext {
        ToolCallContext {
            tenant_id: "acme".into(),
            user_id: "u1".into(),
            correlation_id: "corr-1".into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_read_tool_success_returns_json_string() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(30)));
        let tool = ReadTool::inventory_search(backend, breaker);
        let result = tool.execute(json!({"query": "router"}), &ctx()).await;
        assert!(!result.is_error);
        assert!(result.content.contains("items"));
    }

    #[tokio::test]
    async fn test_read_tool_fails_fast_when_breaker_open() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let breaker = Arc::new(CircuitBreaker::new(2, Duration::from_secs(60)));
        let tool = ReadTool::device_status(backend.clone(), breaker);

        // Two failures trip the breaker.
        let _ = tool.execute(json!({"device_id": "d1"}), &ctx()).await;
        let _ = tool.execute(json!({"device_id": "d1"}), &ctx()).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        // Third call never reaches the backend.
        let result = tool.execute(json!({"device_id": "d1"}), &ctx()).await;
        assert!(result.is_error);
        assert_eq!(result.error_type.as_deref(), Some("circuit_open"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_tool_definitions() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(30)));
        let tool = ReadTool::inventory_search(backend, breaker);
        let def = tool.definition();
        assert_eq!(def.name, "inventory_search");
        assert_eq!(def.input_schema["required"][0], "query");
        assert_eq!(tool.kind(), ToolKind::Read);
    }
}
