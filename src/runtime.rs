use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::llm::ChatProvider;
use crate::orchestrator::ConfirmationHub;
use crate::redactor::Redactor;
use crate::ticket::TicketStore;
use crate::tools::device::HttpDeviceBackend;
use crate::tools::query::HttpQueryBackend;
use crate::tools::ToolRegistry;
use stockpilot_storage::db::Database;

/// Serializes turns per conversation: persistence of turn N happens-before
/// context loading of turn N+1.
pub struct TurnGate {
    locks: tokio::sync::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for TurnGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnGate {
    pub fn new() -> Self {
        TurnGate {
            locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock_for(&self, conversation_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub chat: Option<Arc<dyn ChatProvider>>,
    pub embedding: Option<Arc<dyn EmbeddingProvider>>,
    pub tools: ToolRegistry,
    pub redactor: Redactor,
    pub tickets: TicketStore,
    pub confirmations: ConfirmationHub,
    pub turn_gate: TurnGate,
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let db = Arc::new(Database::new(&config.data_dir)?);

    let chat = crate::llm::create_chat_chain(&config);
    if chat.is_none() {
        warn!("No chat provider could be initialized; the assistant reports itself unavailable");
    }
    let embedding = crate::embedding::create_embedding_chain(&config);
    if embedding.is_none() {
        info!("No embedding provider configured; memory retrieval degrades to no context");
    }

    let query_backend = Arc::new(HttpQueryBackend::new(
        &config.query_service_url,
        &config.service_token,
    ));
    let device_backend = Arc::new(HttpDeviceBackend::new(
        &config.device_service_url,
        &config.service_token,
    ));
    let tools = ToolRegistry::new(&config, query_backend, device_backend, db.clone());

    let tickets = TicketStore::new(config.ticket_ttl_secs, config.ticket_skew_secs);

    let state = Arc::new(AppState {
        config,
        db,
        chat,
        embedding,
        tools,
        redactor: Redactor::with_default_rules(),
        tickets,
        confirmations: ConfirmationHub::new(),
        turn_gate: TurnGate::new(),
    });

    crate::worker::spawn_embedding_worker(state.clone());
    crate::worker::spawn_memory_sweeper(state.clone());
    crate::worker::spawn_ticket_purger(state.clone());

    let web_state = state.clone();
    info!(
        "Starting web server on {}:{}",
        state.config.web_host, state.config.web_port
    );
    tokio::spawn(async move {
        crate::web::start_web_server(web_state).await;
    });

    info!("Runtime active; waiting for Ctrl-C");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("Failed to listen for Ctrl-C: {e}"))?;
    Ok(())
}
