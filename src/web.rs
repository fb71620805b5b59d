mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::runtime::AppState;

#[derive(Clone)]
pub struct WebState {
    pub app: Arc<AppState>,
}

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/stream_ticket", post(api_stream_ticket))
        .route("/ws", get(ws::ws_handler))
        .with_state(WebState { app })
}

pub async fn start_web_server(app: Arc<AppState>) {
    let addr = format!("{}:{}", app.config.web_host, app.config.web_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind web server");
            return;
        }
    };
    info!(%addr, "Web server listening");
    if let Err(e) = axum::serve(listener, router(app)).await {
        error!(error = %e, "Web server exited");
    }
}

fn require_auth(state: &WebState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(expected) = &state.app.config.web_auth_token else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if !provided.is_empty() && provided == expected {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            "invalid or missing bearer token".into(),
        ))
    }
}

/// The assistant reports itself unavailable instead of blocking the rest of
/// the application when no provider chain initialized.
async fn api_health(State(state): State<WebState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "chat_available": state.app.chat.is_some(),
        "embedding_available": state.app.embedding.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

/// Exchange an authenticated HTTP call for a short-lived, single-use
/// streaming ticket.
async fn api_stream_ticket(
    headers: HeaderMap,
    State(state): State<WebState>,
    Json(body): Json<TicketRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    require_auth(&state, &headers)?;

    if body.tenant_id.trim().is_empty()
        || body.user_id.trim().is_empty()
        || body.session_id.trim().is_empty()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "tenant_id, user_id and session_id are required".into(),
        ));
    }

    let token = state
        .app
        .tickets
        .create(
            body.tenant_id.trim(),
            body.user_id.trim(),
            body.session_id.trim(),
            body.conversation_id,
        )
        .await;
    info!(
        target: "web",
        tenant_id = %body.tenant_id,
        user_id = %body.user_id,
        "Issued stream ticket"
    );
    Ok(Json(json!({
        "ok": true,
        "ticket": token,
        "expires_in": state.app.tickets.ttl_secs(),
    })))
}
