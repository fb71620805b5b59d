use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{schema_object, Tool, ToolCallContext, ToolKind, ToolResult};
use crate::error::StockPilotError;
use crate::llm_types::ToolDefinition;
use stockpilot_storage::db::{call_blocking, Database};

/// The external device-management collaborator. A detected conflicting
/// concurrent modification must surface as `StockPilotError::Conflict` so the
/// executor can record it distinctly from a generic failure.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, StockPilotError>;
}

pub struct HttpDeviceBackend {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl HttpDeviceBackend {
    pub fn new(base_url: &str, service_token: &str) -> Self {
        HttpDeviceBackend {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_token: service_token.to_string(),
        }
    }
}

#[async_trait]
impl DeviceBackend for HttpDeviceBackend {
    async fn execute(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, StockPilotError> {
        let url = format!("{}/actions/{}", self.base_url, action);
        let mut req = self.http.post(&url).json(payload);
        if !self.service_token.is_empty() {
            req = req.bearer_auth(&self.service_token);
        }
        let response = req.send().await?;
        let status = response.status();
        if status.as_u16() == 409 {
            let body = response.text().await.unwrap_or_default();
            return Err(StockPilotError::Conflict(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StockPilotError::ToolExecution(format!(
                "device service returned HTTP {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }
}

/// Runs every write action through the audit log. A completed record for the
/// caller's idempotency key short-circuits to the stored result; otherwise a
/// pending record is written, the action executed, and the record moved to
/// completed, failed, or conflict.
pub struct IdempotentExecutor {
    db: Arc<Database>,
}

impl IdempotentExecutor {
    pub fn new(db: Arc<Database>) -> Self {
        IdempotentExecutor { db }
    }

    pub async fn execute(
        &self,
        backend: &dyn DeviceBackend,
        action: &str,
        payload: serde_json::Value,
        ctx: &ToolCallContext,
    ) -> ToolResult {
        let audit_id = match self.prepare_record(action, &payload, ctx).await {
            Ok(Prepared::Replay(result)) => {
                info!(
                    action,
                    correlation_id = %ctx.correlation_id,
                    "Idempotent replay, returning stored result"
                );
                return ToolResult::success(result);
            }
            Ok(Prepared::InFlight) => {
                return ToolResult::error(
                    "A write with this idempotency key is already in progress.".into(),
                )
                .with_error_type("conflict");
            }
            Ok(Prepared::Execute(id)) => id,
            Err(e) => {
                return ToolResult::error(format!("Audit record write failed: {e}"));
            }
        };

        match backend.execute(action, &payload).await {
            Ok(result) => {
                let result_clone = result.clone();
                let db = self.db.clone();
                let stored = call_blocking(db, move |db| {
                    db.set_audit_result(audit_id, "completed", Some(&result_clone))
                })
                .await;
                if let Err(e) = stored {
                    warn!(action, audit_id, error = %e, "Failed to complete audit record");
                }
                ToolResult::success(result.to_string())
            }
            Err(StockPilotError::Conflict(detail)) => {
                let db = self.db.clone();
                let detail_clone = detail.clone();
                let _ = call_blocking(db, move |db| {
                    db.set_audit_result(audit_id, "conflict", Some(&json!({"error": detail_clone})))
                })
                .await;
                ToolResult::error(format!(
                    "The item was modified concurrently; re-read its state and retry. ({detail})"
                ))
                .with_error_type("conflict")
            }
            Err(e) => {
                let db = self.db.clone();
                let message = e.to_string();
                let message_clone = message.clone();
                let _ = call_blocking(db, move |db| {
                    db.set_audit_result(audit_id, "failed", Some(&json!({"error": message_clone})))
                })
                .await;
                ToolResult::error(format!("Write action failed: {message}"))
            }
        }
    }

    async fn prepare_record(
        &self,
        action: &str,
        payload: &serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<Prepared, StockPilotError> {
        if let Some(key) = &ctx.idempotency_key {
            let tenant = ctx.tenant_id.clone();
            let key_clone = key.clone();
            let prior = call_blocking(self.db.clone(), move |db| {
                db.find_audit_by_key(&tenant, &key_clone)
            })
            .await?;

            if let Some(record) = prior {
                return match record.status.as_str() {
                    "completed" => {
                        let stored = record
                            .result
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| json!({"ok": true}).to_string());
                        Ok(Prepared::Replay(stored))
                    }
                    "pending" => Ok(Prepared::InFlight),
                    // failed / conflict: the caller is retrying; reuse the row
                    _ => {
                        let id = record.id;
                        call_blocking(self.db.clone(), move |db| {
                            db.set_audit_result(id, "pending", None)
                        })
                        .await?;
                        Ok(Prepared::Execute(id))
                    }
                };
            }
        }

        let tenant = ctx.tenant_id.clone();
        let user = ctx.user_id.clone();
        let action = action.to_string();
        let payload = payload.clone();
        let key = ctx.idempotency_key.clone();
        let correlation = ctx.correlation_id.clone();
        let inserted = call_blocking(self.db.clone(), move |db| {
            db.insert_audit_pending(
                &tenant,
                &user,
                &action,
                &payload,
                key.as_deref(),
                Some(&correlation),
            )
        })
        .await;

        match inserted {
            Ok(id) => Ok(Prepared::Execute(id)),
            // Unique-key race with a concurrent request: treat as in flight.
            Err(StockPilotError::Database(_)) => Ok(Prepared::InFlight),
            Err(e) => Err(e),
        }
    }
}

enum Prepared {
    Replay(String),
    InFlight,
    Execute(i64),
}

/// A write tool routed through the idempotent executor. Destructive actions
/// set `requires_confirmation` and suspend until the client approves.
pub struct WriteTool {
    name: &'static str,
    description: &'static str,
    input_schema: serde_json::Value,
    requires_confirmation: bool,
    backend: Arc<dyn DeviceBackend>,
    executor: Arc<IdempotentExecutor>,
}

impl WriteTool {
    pub fn adjust_stock(backend: Arc<dyn DeviceBackend>, executor: Arc<IdempotentExecutor>) -> Self {
        WriteTool {
            name: "adjust_stock",
            description: "Adjust the on-hand quantity of an inventory item by a signed delta, \
                          with a reason for the adjustment.",
            input_schema: schema_object(
                json!({
                    "item_id": {"type": "string", "description": "Inventory item identifier"},
                    "delta": {"type": "integer", "description": "Signed quantity change"},
                    "reason": {"type": "string", "description": "Why the stock level changed"}
                }),
                &["item_id", "delta"],
            ),
            requires_confirmation: false,
            backend,
            executor,
        }
    }

    pub fn assign_device(
        backend: Arc<dyn DeviceBackend>,
        executor: Arc<IdempotentExecutor>,
    ) -> Self {
        WriteTool {
            name: "assign_device",
            description: "Assign a device to a person or location.",
            input_schema: schema_object(
                json!({
                    "device_id": {"type": "string", "description": "Device identifier"},
                    "assignee": {"type": "string", "description": "Person or location receiving the device"}
                }),
                &["device_id", "assignee"],
            ),
            requires_confirmation: false,
            backend,
            executor,
        }
    }

    pub fn retire_device(
        backend: Arc<dyn DeviceBackend>,
        executor: Arc<IdempotentExecutor>,
    ) -> Self {
        WriteTool {
            name: "retire_device",
            description: "Permanently retire a device from the inventory. \
                          This cannot be undone and requires user approval.",
            input_schema: schema_object(
                json!({
                    "device_id": {"type": "string", "description": "Device identifier"},
                    "reason": {"type": "string", "description": "Why the device is being retired"}
                }),
                &["device_id"],
            ),
            requires_confirmation: true,
            backend,
            executor,
        }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Write {
            requires_confirmation: self.requires_confirmation,
        }
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema.clone(),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolCallContext) -> ToolResult {
        self.executor
            .execute(self.backend.as_ref(), self.name, input, ctx)
            .await
    }
}
