//! WebSocket transport around the presence protocol.
//!
//! Flow per connection:
//! 1. Resolve the principal from proxy headers, map it to a descriptor
//! 2. Accept the WS upgrade
//! 3. Run the presence session; a pump task serializes its events onto
//!    the socket and watches for the client going away
//! 4. Socket teardown drops the event receiver, which is the session's
//!    signal to publish its leave and release the subscription

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::PresenceError;
use crate::identity::Principal;
use crate::presence::run_session;
use crate::state::AppState;
use crate::types::{ClientEvent, UserDescriptor};

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    /// Page key grouping sessions that should discover one another.
    pub page: String,
}

/// Axum handler for GET /presence — upgrades to WebSocket.
pub async fn presence_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<PresenceQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, PresenceError> {
    let principal = principal_from_headers(&headers)?;
    let descriptor = (state.resolver)(&principal);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, query.page, descriptor)))
}

/// Principal as injected by the upstream auth proxy. `x-user-name` is
/// optional and defaults to the id.
fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, PresenceError> {
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or(PresenceError::MissingIdentity)?
        .to_string();
    let name = headers
        .get("x-user-name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&id)
        .to_string();
    Ok(Principal { id, name })
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    page: String,
    descriptor: UserDescriptor,
) {
    let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(state.config.event_buffer);
    let pump = tokio::spawn(client_pump(socket, event_rx));

    match run_session(&state.broker, &page, descriptor, event_tx).await {
        Ok(()) => info!(page, "presence session closed"),
        Err(e) => warn!(page, "presence session ended: {e}"),
    }

    let _ = pump.await;
}

/// Bridge session events onto the socket while watching the client side.
/// Ends — dropping the event receiver — when the client closes, errors,
/// or the session itself is over.
async fn client_pump(socket: WebSocket, mut events: mpsc::Receiver<ClientEvent>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("event serialize error: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Session over; say goodbye properly.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("ws recv error: {e}");
                    break;
                }
                // Inbound frames carry no protocol meaning; pings are
                // answered by axum.
                Some(Ok(_)) => {}
            },
        }
    }
}
