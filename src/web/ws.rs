use std::collections::VecDeque;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::WebState;
use crate::events::StreamEvent;
use crate::orchestrator::{run_turn, TurnOutcome, TurnRequest};
use crate::ticket::{StreamTicket, TicketError};

/// Close code telling the client its ticket was rejected: request a fresh
/// one instead of retrying the same token.
pub(super) const CLOSE_REAUTHENTICATE: u16 = 4001;

#[derive(Debug, Deserialize)]
pub(super) struct WsQuery {
    #[serde(default)]
    pub ticket: Option<String>,
}

/// Frames the client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message {
        text: String,
        #[serde(default)]
        conversation_id: Option<i64>,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    ConfirmationResponse {
        confirmation_id: String,
        approved: bool,
    },
    Cancel,
}

struct ActiveTurn {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WebState>,
) -> Response {
    // Validate-and-consume before any further traffic is accepted. The
    // upgrade still completes so the close code can carry the reason.
    let ticket = match query.ticket.as_deref() {
        Some(token) => state.app.tickets.consume(token).await,
        None => Err(TicketError::NotFound),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, ticket))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: WebState,
    ticket: Result<StreamTicket, TicketError>,
) {
    let ticket = match ticket {
        Ok(ticket) => ticket,
        Err(e) => {
            let reason = match e {
                TicketError::NotFound => "ticket invalid or already used",
                TicketError::Expired => "ticket expired",
            };
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_REAUTHENTICATE,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    info!(
        target: "web",
        tenant_id = %ticket.tenant_id,
        user_id = %ticket.user_id,
        session_id = %ticket.session_id,
        "Stream connection accepted"
    );

    // One event channel for the whole connection; only one turn writes at a
    // time, so per-turn ordering is preserved. The bounded capacity gives
    // backpressure: the turn task suspends while the writer drains at client
    // speed.
    let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(256);
    let (done_tx, mut done_rx) = mpsc::channel::<TurnOutcome>(4);

    // Incoming messages queue; turns run strictly one at a time, so
    // persistence of turn N happens-before context loading of turn N+1.
    let mut pending: VecDeque<TurnRequest> = VecDeque::new();
    let mut current: Option<ActiveTurn> = None;
    let mut session_conversation = ticket.conversation_id;

    loop {
        if current.is_none() {
            if let Some(req) = pending.pop_front() {
                current = Some(start_turn(&state, req, events_tx.clone(), done_tx.clone()));
            }
        }

        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Message { text, conversation_id, idempotency_key }) => {
                            pending.push_back(TurnRequest {
                                tenant_id: ticket.tenant_id.clone(),
                                user_id: ticket.user_id.clone(),
                                conversation_id: conversation_id.or(session_conversation),
                                text,
                                idempotency_key,
                            });
                        }
                        Ok(ClientFrame::ConfirmationResponse { confirmation_id, approved }) => {
                            if !state.app.confirmations.resolve(&confirmation_id, approved).await {
                                warn!(
                                    target: "web",
                                    %confirmation_id,
                                    "Confirmation response for unknown or expired id"
                                );
                            }
                        }
                        Ok(ClientFrame::Cancel) => {
                            if let Some(turn) = &current {
                                let _ = turn.cancel_tx.send(true);
                            }
                        }
                        Err(e) => {
                            warn!(target: "web", error = %e, "Unparseable client frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    // Connection loss implies cancel for the in-flight turn.
                    abort_turn(current.take(), &mut events_rx).await;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!(target: "web", error = %e, "Socket read failed");
                    abort_turn(current.take(), &mut events_rx).await;
                    break;
                }
            },
            event = events_rx.recv() => {
                // The local events_tx clone keeps the channel open, so recv
                // only yields real events.
                if let Some(event) = event {
                    if !forward_event(&mut socket, &event).await {
                        abort_turn(current.take(), &mut events_rx).await;
                        break;
                    }
                }
            },
            outcome = done_rx.recv() => {
                // The finished turn's events are all already queued; flush
                // them before accepting the next turn so turns never
                // interleave on the wire.
                let mut ok = true;
                while let Ok(event) = events_rx.try_recv() {
                    if !forward_event(&mut socket, &event).await {
                        ok = false;
                        break;
                    }
                }
                if let Some(turn) = current.take() {
                    let _ = turn.handle.await;
                }
                if !ok {
                    break;
                }
                if let Some(outcome) = outcome {
                    if outcome.conversation_id.is_some() {
                        session_conversation = outcome.conversation_id;
                    }
                }
            },
        }
    }

    info!(
        target: "web",
        tenant_id = %ticket.tenant_id,
        session_id = %ticket.session_id,
        "Stream connection closed"
    );
}

/// Send one event; false when the client is gone.
async fn forward_event(socket: &mut WebSocket, event: &StreamEvent) -> bool {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(_) => return true,
    };
    socket.send(WsMessage::Text(payload)).await.is_ok()
}

/// Cancel the in-flight turn (if any) and wait for its partial-transcript
/// persistence to complete. The event queue is drained so a turn blocked on
/// a full channel wakes up and observes the cancel flag.
async fn abort_turn(current: Option<ActiveTurn>, events_rx: &mut mpsc::Receiver<StreamEvent>) {
    if let Some(turn) = current {
        let _ = turn.cancel_tx.send(true);
        let mut handle = turn.handle;
        loop {
            tokio::select! {
                _ = events_rx.recv() => {}
                result = &mut handle => {
                    if let Err(e) = result {
                        warn!(target: "web", error = %e, "Turn task failed during abort");
                    }
                    break;
                }
            }
        }
        // Drop whatever the cancelled turn still had queued.
        while events_rx.try_recv().is_ok() {}
    }
}

fn start_turn(
    state: &WebState,
    req: TurnRequest,
    events_tx: mpsc::Sender<StreamEvent>,
    done_tx: mpsc::Sender<TurnOutcome>,
) -> ActiveTurn {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let app = state.app.clone();

    let handle = tokio::spawn(async move {
        let mut cancel_rx = cancel_rx;
        // Conversation-level serialization for turns arriving over different
        // sockets; same-socket turns are already queued.
        let gate = match req.conversation_id {
            Some(id) => Some(app.turn_gate.lock_for(id).await),
            None => None,
        };
        let _guard = match &gate {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let outcome = run_turn(&app, req, &events_tx, &mut cancel_rx).await;
        let _ = done_tx.send(outcome).await;
    });

    ActiveTurn { cancel_tx, handle }
}
