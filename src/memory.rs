use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::StockPilotError;
use crate::llm::ChatProvider;
use crate::llm_types::{Message, ResponseContentBlock};
use stockpilot_storage::db::{call_blocking, Database};
use stockpilot_storage::models::{JobTarget, Memory};

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Content hash used for per-(tenant, user) dedup. Whitespace runs collapse
/// so trivially reformatted restatements of the same fact collide.
pub fn content_hash(content: &str) -> String {
    let normalized = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.to_lowercase().as_bytes());
    format!("{digest:x}")
}

/// Top-K memories for the query, ranked by cosine similarity against vectors
/// produced by the active embedding model only. Failures degrade to an empty
/// result; memory retrieval is never fatal to a turn.
pub async fn search_memories(
    db: &Arc<Database>,
    embedding: &Option<Arc<dyn EmbeddingProvider>>,
    tenant_id: &str,
    user_id: &str,
    query: &str,
    top_k: usize,
    candidate_limit: usize,
) -> Vec<Memory> {
    let Some(provider) = embedding else {
        return Vec::new();
    };
    if query.trim().is_empty() || top_k == 0 {
        return Vec::new();
    }

    let query_vec = match provider.embed(query).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Memory retrieval degraded: query embedding failed");
            return Vec::new();
        }
    };

    let model = provider.model().to_string();
    let tenant = tenant_id.to_string();
    let user = user_id.to_string();
    let candidates = match call_blocking(db.clone(), move |db| {
        db.get_memories_with_embedding(&tenant, &user, &model, candidate_limit)
    })
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "Memory retrieval degraded: candidate load failed");
            return Vec::new();
        }
    };

    let mut scored: Vec<(f32, Memory)> = candidates
        .into_iter()
        .filter_map(|m| {
            let vector = m.embedding.as_deref()?;
            Some((cosine_similarity(&query_vec, vector), m))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    let selected: Vec<Memory> = scored.into_iter().map(|(_, m)| m).collect();
    if !selected.is_empty() {
        let ids: Vec<i64> = selected.iter().map(|m| m.id).collect();
        let id_count = ids.len();
        if let Err(e) = call_blocking(db.clone(), move |db| db.touch_memory_access(&ids)).await {
            warn!(error = %e, "Failed to record memory access");
        }
        info!(
            tenant_id,
            user_id,
            retrieved = id_count,
            "Memory retrieval completed"
        );
    }
    selected
}

/// Render retrieved memories as a system-prompt block.
pub fn memory_context_block(memories: &[Memory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("<relevant_memories>\n");
    for m in memories {
        out.push_str(&format!(
            "[{}] (confidence {:.2}) {}\n",
            m.kind, m.confidence, m.content
        ));
    }
    out.push_str("</relevant_memories>\n");
    out
}

pub const EXTRACTOR_SYSTEM_PROMPT: &str = r#"You are a memory extraction specialist for an inventory assistant. Extract durable, factual information from the conversation.

Rules:
- Extract ONLY concrete facts, user preferences, named entities, or procedures
- IGNORE: greetings, small talk, unanswered questions, transient requests
- Each memory < 200 characters, specific and concrete
- type must be exactly one of: fact, preference, entity, procedure
- confidence is your certainty in [0, 1]
- Output ONLY a valid JSON array: [{"type":"fact","content":"...","confidence":0.8}]
- If nothing worth remembering: []"#;

#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub kind: String,
    pub content: String,
    pub confidence: f64,
}

/// Parse the extractor's reply. Tolerates prose around the JSON array by
/// slicing between the first '[' and last ']'. Unknown types and empty
/// contents are dropped; confidence is clamped to [0, 1]; the list is capped.
pub fn parse_extracted_facts(text: &str, max_facts: usize) -> Vec<ExtractedFact> {
    let parsed: Vec<serde_json::Value> = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(_) => {
            let start = text.find('[').unwrap_or(0);
            let end = text.rfind(']').map(|i| i + 1).unwrap_or(text.len());
            if start >= end {
                return Vec::new();
            }
            match serde_json::from_str(&text[start..end]) {
                Ok(v) => v,
                Err(_) => return Vec::new(),
            }
        }
    };

    let mut out = Vec::new();
    for item in parsed {
        if out.len() >= max_facts {
            break;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_str()) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() || content.len() > 400 {
            continue;
        }
        let kind = item
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("fact")
            .to_lowercase();
        if !matches!(kind.as_str(), "fact" | "preference" | "entity" | "procedure") {
            continue;
        }
        let confidence = item
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        out.push(ExtractedFact {
            kind,
            content: content.to_string(),
            confidence,
        });
    }
    out
}

/// Ask the model for fact candidates and upsert them. A colliding content
/// hash raises the stored confidence to the max of old and new. Each touched
/// memory gets an embedding job (conflict on enqueue means one is already
/// queued, which is fine). Returns how many memories were upserted.
#[allow(clippy::too_many_arguments)]
pub async fn extract_facts(
    chat: &dyn ChatProvider,
    db: &Arc<Database>,
    tenant_id: &str,
    user_id: &str,
    conversation_id: i64,
    source_message_id: i64,
    transcript: &str,
    max_facts: usize,
    embed_max_retries: i64,
) -> Result<usize, StockPilotError> {
    let user_msg = Message::user(format!(
        "Extract memories from this conversation:\n\n{transcript}"
    ));
    let response = chat
        .send_message(EXTRACTOR_SYSTEM_PROMPT, vec![user_msg], None)
        .await?;

    let text = response
        .content
        .iter()
        .filter_map(|b| match b {
            ResponseContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    let facts = parse_extracted_facts(&text, max_facts);
    let mut upserted = 0usize;

    for fact in facts {
        let hash = content_hash(&fact.content);
        let tenant = tenant_id.to_string();
        let user = user_id.to_string();
        let memory_id = call_blocking(db.clone(), move |db| {
            db.upsert_memory(
                &tenant,
                &user,
                &fact.kind,
                &fact.content,
                &hash,
                fact.confidence,
                None,
                Some(conversation_id),
                Some(source_message_id),
            )
        })
        .await?;
        upserted += 1;

        let enqueued = call_blocking(db.clone(), move |db| {
            db.enqueue_embedding_job(JobTarget::Memory(memory_id), embed_max_retries)
        })
        .await;
        if let Err(e) = enqueued {
            warn!(memory_id, error = %e, "Failed to enqueue memory embedding job");
        }
    }

    if upserted > 0 {
        info!(tenant_id, user_id, upserted, "Fact extraction completed");
    }
    Ok(upserted)
}
