use rusqlite::OptionalExtension;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use stockpilot_core::error::StockPilotError;

use crate::models::{
    AuditRecord, Conversation, EmbeddingJob, JobTarget, Memory, NewMessage, StoredMessage,
};

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, StockPilotError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, StockPilotError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| StockPilotError::ToolExecution(format!("DB task join error: {e}")))?
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, StockPilotError> {
        let db_path = Path::new(data_dir).join("stockpilot.db");
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT,
                summary TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_tenant_user
                ON conversations(tenant_id, user_id, updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                thinking_summary TEXT,
                tool_calls TEXT,
                embedding TEXT,
                embedding_model TEXT,
                embedding_dimension INTEGER,
                embedding_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.70,
                valid_from TEXT,
                valid_until TEXT,
                is_invalidated INTEGER NOT NULL DEFAULT 0,
                invalidated_at TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT,
                source_conversation_id INTEGER,
                source_message_id INTEGER,
                embedding TEXT,
                embedding_model TEXT,
                embedding_dimension INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(tenant_id, user_id, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_memories_tenant_user
                ON memories(tenant_id, user_id, is_invalidated);

            CREATE TABLE IF NOT EXISTS embedding_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_kind TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retries INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                locked_at TEXT,
                locked_by TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(target_kind, target_id)
            );

            CREATE INDEX IF NOT EXISTS idx_embedding_jobs_status
                ON embedding_jobs(status, locked_at);

            CREATE TABLE IF NOT EXISTS audit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                result TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                idempotency_key TEXT,
                correlation_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_idempotency
                ON audit_records(tenant_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL;",
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // --- Conversations ---

    pub fn create_conversation(
        &self,
        tenant_id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO conversations (tenant_id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![tenant_id, user_id, title, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Tenant and user are exact-match filters on every lookup; a conversation
    /// id from another tenant behaves as if it does not exist.
    pub fn get_conversation(
        &self,
        id: i64,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<Conversation>, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, tenant_id, user_id, title, summary, message_count, created_at, updated_at
             FROM conversations
             WHERE id = ?1 AND tenant_id = ?2 AND user_id = ?3",
            params![id, tenant_id, user_id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    user_id: row.get(2)?,
                    title: row.get(3)?,
                    summary: row.get(4)?,
                    message_count: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_conversation_summary(
        &self,
        id: i64,
        summary: &str,
    ) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE conversations SET summary = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, summary, now_rfc3339()],
        )?;
        Ok(())
    }

    // --- Messages ---

    /// Insert a turn's messages and bump the conversation's message_count in
    /// one transaction. Returns the new message ids in insertion order.
    pub fn append_turn_messages(
        &self,
        conversation_id: i64,
        messages: &[NewMessage],
    ) -> Result<Vec<i64>, StockPilotError> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let now = now_rfc3339();
        let mut ids = Vec::with_capacity(messages.len());
        for msg in messages {
            let tool_calls_json = msg
                .tool_calls
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO messages
                    (conversation_id, role, content, thinking_summary, tool_calls,
                     embedding_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    conversation_id,
                    msg.role,
                    msg.content,
                    msg.thinking_summary,
                    tool_calls_json,
                    now,
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.execute(
            "UPDATE conversations
             SET message_count = message_count + ?2, updated_at = ?3
             WHERE id = ?1",
            params![conversation_id, messages.len() as i64, now],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StockPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, thinking_summary, tool_calls,
                    embedding_model, embedding_status, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        // Reverse so oldest first
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, conversation_id, role, content, thinking_summary, tool_calls,
                    embedding_model, embedding_status, created_at
             FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Vector, model name and dimension land in one UPDATE; the row is never
    /// left with a vector but no model.
    pub fn set_message_embedding(
        &self,
        id: i64,
        embedding: &[f32],
        model: &str,
        dimension: usize,
    ) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        let vector_json = serde_json::to_string(embedding)?;
        conn.execute(
            "UPDATE messages
             SET embedding = ?2, embedding_model = ?3, embedding_dimension = ?4,
                 embedding_status = 'completed'
             WHERE id = ?1",
            params![id, vector_json, model, dimension as i64],
        )?;
        Ok(())
    }

    pub fn set_message_embedding_status(
        &self,
        id: i64,
        status: &str,
    ) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE messages SET embedding_status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    // --- Memories ---

    /// Insert a memory, or on a (tenant, user, content_hash) collision raise
    /// the stored confidence to the max of old and new and refresh updated_at.
    /// This is the sole dedup mechanism. Returns the row id either way.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_memory(
        &self,
        tenant_id: &str,
        user_id: &str,
        kind: &str,
        content: &str,
        content_hash: &str,
        confidence: f64,
        valid_until: Option<&str>,
        source_conversation_id: Option<i64>,
        source_message_id: Option<i64>,
    ) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO memories
                (tenant_id, user_id, kind, content, content_hash, confidence,
                 valid_from, valid_until, source_conversation_id, source_message_id,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?7, ?7)
             ON CONFLICT(tenant_id, user_id, content_hash) DO UPDATE SET
                confidence = MAX(confidence, excluded.confidence),
                updated_at = excluded.updated_at",
            params![
                tenant_id,
                user_id,
                kind,
                content,
                content_hash,
                confidence,
                now,
                valid_until,
                source_conversation_id,
                source_message_id,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM memories
             WHERE tenant_id = ?1 AND user_id = ?2 AND content_hash = ?3",
            params![tenant_id, user_id, content_hash],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_memory(&self, id: i64) -> Result<Option<Memory>, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!("{MEMORY_SELECT} WHERE id = ?1"),
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_active_memories(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, StockPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "{MEMORY_SELECT}
             WHERE tenant_id = ?1 AND user_id = ?2 AND is_invalidated = 0
             ORDER BY updated_at DESC
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![tenant_id, user_id, limit as i64], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candidates for semantic ranking: only rows embedded with exactly the
    /// requested model are comparable to the query vector.
    pub fn get_memories_with_embedding(
        &self,
        tenant_id: &str,
        user_id: &str,
        model: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, StockPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "{MEMORY_SELECT}
             WHERE tenant_id = ?1 AND user_id = ?2 AND is_invalidated = 0
               AND embedding IS NOT NULL AND embedding_model = ?3
             ORDER BY updated_at DESC
             LIMIT ?4"
        ))?;
        let rows = stmt
            .query_map(
                params![tenant_id, user_id, model, limit as i64],
                row_to_memory,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn touch_memory_access(&self, ids: &[i64]) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        for id in ids {
            conn.execute(
                "UPDATE memories
                 SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
        }
        Ok(())
    }

    pub fn set_memory_embedding(
        &self,
        id: i64,
        embedding: &[f32],
        model: &str,
        dimension: usize,
    ) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        let vector_json = serde_json::to_string(embedding)?;
        conn.execute(
            "UPDATE memories
             SET embedding = ?2, embedding_model = ?3, embedding_dimension = ?4
             WHERE id = ?1",
            params![id, vector_json, model, dimension as i64],
        )?;
        Ok(())
    }

    pub fn invalidate_expired_memories(&self, now: &str) -> Result<usize, StockPilotError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE memories
             SET is_invalidated = 1, invalidated_at = ?1
             WHERE is_invalidated = 0 AND valid_until IS NOT NULL AND valid_until < ?1",
            params![now],
        )?;
        Ok(n)
    }

    /// Multiply confidence by `factor` for memories not touched since
    /// `cutoff`. updated_at is refreshed so a row decays once per window, not
    /// once per sweep cycle.
    pub fn decay_unused_confidence(
        &self,
        cutoff: &str,
        factor: f64,
    ) -> Result<usize, StockPilotError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "UPDATE memories
             SET confidence = confidence * ?2, updated_at = ?3
             WHERE is_invalidated = 0
               AND COALESCE(last_accessed_at, updated_at) < ?1",
            params![cutoff, factor, now_rfc3339()],
        )?;
        Ok(n)
    }

    pub fn purge_invalidated_memories(&self, cutoff: &str) -> Result<usize, StockPilotError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "DELETE FROM memories
             WHERE is_invalidated = 1 AND invalidated_at IS NOT NULL AND invalidated_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    // --- Embedding jobs ---

    /// Enqueue a job for a target. At most one job per target exists; a
    /// conflicting enqueue is a no-op and reports `false`.
    pub fn enqueue_embedding_job(
        &self,
        target: JobTarget,
        max_retries: i64,
    ) -> Result<bool, StockPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        let n = conn.execute(
            "INSERT INTO embedding_jobs
                (target_kind, target_id, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(target_kind, target_id) DO NOTHING",
            params![target.kind(), target.id(), max_retries, now],
        )?;
        Ok(n > 0)
    }

    /// Claim up to `batch` jobs for `worker_id` in one transaction: pending
    /// jobs, plus processing jobs whose lock is older than `stale_before`
    /// (their worker is presumed dead). The guarded UPDATE re-checks the
    /// status so two workers never claim the same row.
    pub fn claim_embedding_jobs(
        &self,
        worker_id: &str,
        batch: usize,
        stale_before: &str,
    ) -> Result<Vec<EmbeddingJob>, StockPilotError> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let now = now_rfc3339();

        let candidate_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM embedding_jobs
                 WHERE status = 'pending'
                    OR (status = 'processing' AND locked_at IS NOT NULL AND locked_at < ?1)
                 ORDER BY id
                 LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![stale_before, batch as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let n = tx.execute(
                "UPDATE embedding_jobs
                 SET status = 'processing', locked_by = ?2, locked_at = ?3, updated_at = ?3
                 WHERE id = ?1
                   AND (status = 'pending'
                        OR (status = 'processing' AND locked_at IS NOT NULL AND locked_at < ?4))",
                params![id, worker_id, now, stale_before],
            )?;
            if n == 0 {
                continue;
            }
            let job = tx.query_row(
                "SELECT id, target_kind, target_id, status, retries, max_retries,
                        locked_at, locked_by, last_error
                 FROM embedding_jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )?;
            if let Some(job) = job {
                claimed.push(job);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn complete_embedding_job(&self, id: i64) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE embedding_jobs
             SET status = 'completed', locked_by = NULL, locked_at = NULL,
                 last_error = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a failed attempt. The job goes back to pending until its retry
    /// budget is spent, then to dead. Returns the resulting status.
    pub fn fail_embedding_job(&self, id: i64, error: &str) -> Result<String, StockPilotError> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let (retries, max_retries): (i64, i64) = tx.query_row(
            "SELECT retries, max_retries FROM embedding_jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let status = if retries + 1 >= max_retries {
            "dead"
        } else {
            "pending"
        };
        tx.execute(
            "UPDATE embedding_jobs
             SET status = ?2, retries = retries + 1, locked_by = NULL, locked_at = NULL,
                 last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, status, error, now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(status.to_string())
    }

    pub fn get_embedding_job(&self, id: i64) -> Result<Option<EmbeddingJob>, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, target_kind, target_id, status, retries, max_retries,
                    locked_at, locked_by, last_error
             FROM embedding_jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )
        .optional()
        .map_err(StockPilotError::from)
        .map(Option::flatten)
    }

    pub fn count_embedding_jobs(&self, status: &str) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM embedding_jobs WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // --- Audit records ---

    pub fn find_audit_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<AuditRecord>, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!("{AUDIT_SELECT} WHERE tenant_id = ?1 AND idempotency_key = ?2"),
            params![tenant_id, idempotency_key],
            row_to_audit,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Insert the pending record for a write action. A duplicate idempotency
    /// key for the tenant violates the unique index and surfaces as a
    /// constraint error; the executor maps that to a conflict.
    pub fn insert_audit_pending(
        &self,
        tenant_id: &str,
        user_id: &str,
        action: &str,
        payload: &serde_json::Value,
        idempotency_key: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO audit_records
                (tenant_id, user_id, action, payload, status, idempotency_key,
                 correlation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?7)",
            params![
                tenant_id,
                user_id,
                action,
                serde_json::to_string(payload)?,
                idempotency_key,
                correlation_id,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Transition a pending record to completed/failed/conflict with its
    /// result payload. Records are append-only apart from this transition.
    pub fn set_audit_result(
        &self,
        id: i64,
        status: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StockPilotError> {
        let conn = self.lock_conn();
        let result_json = result.map(serde_json::to_string).transpose()?;
        conn.execute(
            "UPDATE audit_records
             SET status = ?2, result = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, status, result_json, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_audits_for_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM audit_records
             WHERE tenant_id = ?1 AND idempotency_key = ?2",
            params![tenant_id, idempotency_key],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn count_audits_for_tenant(&self, tenant_id: &str) -> Result<i64, StockPilotError> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM audit_records WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }
}

const MEMORY_SELECT: &str = "SELECT id, tenant_id, user_id, kind, content, content_hash,
        confidence, valid_from, valid_until, is_invalidated, access_count,
        last_accessed_at, source_conversation_id, source_message_id,
        embedding, embedding_model, created_at, updated_at
 FROM memories";

const AUDIT_SELECT: &str = "SELECT id, tenant_id, user_id, action, payload, result, status,
        idempotency_key, correlation_id, created_at, updated_at
 FROM audit_records";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let tool_calls: Option<String> = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        thinking_summary: row.get(4)?,
        tool_calls: tool_calls.and_then(|s| serde_json::from_str(&s).ok()),
        embedding_model: row.get(6)?,
        embedding_status: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let embedding: Option<String> = row.get(14)?;
    Ok(Memory {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        kind: row.get(3)?,
        content: row.get(4)?,
        content_hash: row.get(5)?,
        confidence: row.get(6)?,
        valid_from: row.get(7)?,
        valid_until: row.get(8)?,
        is_invalidated: row.get::<_, i64>(9)? != 0,
        access_count: row.get(10)?,
        last_accessed_at: row.get(11)?,
        source_conversation_id: row.get(12)?,
        source_message_id: row.get(13)?,
        embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
        embedding_model: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let payload: String = row.get(4)?;
    let result: Option<String> = row.get(5)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        action: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        status: row.get(6)?,
        idempotency_key: row.get(7)?,
        correlation_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<EmbeddingJob>> {
    let kind: String = row.get(1)?;
    let target_id: i64 = row.get(2)?;
    let Some(target) = JobTarget::from_parts(&kind, target_id) else {
        return Ok(None);
    };
    Ok(Some(EmbeddingJob {
        id: row.get(0)?,
        target,
        status: row.get(3)?,
        retries: row.get(4)?,
        max_retries: row.get(5)?,
        locked_at: row.get(6)?,
        locked_by: row.get(7)?,
        last_error: row.get(8)?,
    }))
}
