// WebSocket upgrade and the per-connection socket task.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
};
use beacon_common::protocol::ws::{
    parse_client_message, ClientMessage, ClientMessageError, ServerEvent, WsErrorCode,
};
use beacon_common::room::Room;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::jwt::Identity;
use crate::auth::middleware::extract_bearer_token;
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::realtime::registry::ClientFrame;
use crate::realtime::RealtimeState;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsUpgradeQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /v1/realtime/ws`. The access token arrives either as a `token`
/// query parameter (browser WebSocket clients cannot set headers) or
/// as a standard bearer header.
///
/// Verification happens before the upgrade completes, but a failure is
/// reported over the socket: the upgrade is accepted and immediately
/// closed with a policy-violation close frame, which is the only
/// channel a browser client can observe the reason on.
pub async fn ws_upgrade(
    State(state): State<RealtimeState>,
    Query(query): Query<WsUpgradeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer_token)
            .map(ToOwned::to_owned)
    });

    let identity = token.and_then(|token| match state.verifier.verify_token(&token) {
        Ok(identity) => Some(identity),
        Err(error) => {
            debug!(?error, "websocket token rejected");
            None
        }
    });

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, async move {
            match identity {
                Some(identity) => handle_socket(state, identity, socket).await,
                None => close_unauthorized(socket).await,
            }
        })
        .await;
    })
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication required".into(),
        })))
        .await;
}

async fn handle_socket(state: RealtimeState, identity: Identity, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ClientFrame>();

    state
        .registry
        .register(connection_id, outbound_sender, identity.user_id, identity.email.clone())
        .await;

    loop {
        tokio::select! {
            maybe_frame = outbound_receiver.recv() => {
                match maybe_frame {
                    Some(ClientFrame::Event(raw)) => {
                        if socket.send(Message::Text(raw.as_ref().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientFrame::Probe) => {
                        if socket.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientFrame::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        let response =
                            handle_text(&state, connection_id, identity.user_id, &raw).await;
                        if let Some(event) = response {
                            if send_event(&mut socket, &event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        state.registry.record_liveness(connection_id).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        state.registry.record_liveness(connection_id).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    state.registry.remove(connection_id).await;
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = event.encode().map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Handle one inbound text frame. Returns the envelope to send back,
/// if the frame warrants one. Protocol errors never close the
/// connection; the client gets an `error` envelope and the socket
/// stays up.
pub(crate) async fn handle_text(
    state: &RealtimeState,
    connection_id: Uuid,
    user_id: Uuid,
    raw: &str,
) -> Option<ServerEvent> {
    let limiter = &state.limiters.ws_messages;
    if limiter.is_limited(&user_id.to_string()).await {
        let retry_after = limiter.retry_after_seconds(&user_id.to_string()).await;
        return Some(ServerEvent::rate_limit_error(retry_after));
    }

    match parse_client_message(raw) {
        Ok(ClientMessage::Subscribe { rooms }) => {
            log_unconventional_rooms(&rooms);
            if !state.registry.subscribe(connection_id, &rooms).await {
                warn!(connection_id = %connection_id, "subscribe from unregistered connection");
            }
            None
        }
        Ok(ClientMessage::Unsubscribe { rooms }) => {
            state.registry.unsubscribe(connection_id, &rooms).await;
            None
        }
        Ok(ClientMessage::Ping) => {
            state.registry.record_liveness(connection_id).await;
            Some(ServerEvent::pong())
        }
        Err(ClientMessageError::Unrecognized { kind }) => {
            // Newer clients may speak message kinds this relay predates.
            debug!(connection_id = %connection_id, kind = %kind, "ignoring unrecognized client message");
            None
        }
        Err(error @ (ClientMessageError::Malformed | ClientMessageError::InvalidRooms)) => {
            Some(ServerEvent::error(WsErrorCode::InvalidMessage, &error.to_string()))
        }
    }
}

/// Room names outside the `scope:id` convention still subscribe, but
/// leave a trace for debugging misbehaving clients.
fn log_unconventional_rooms(rooms: &[String]) {
    for room in rooms {
        if let Err(error) = Room::from_str(room) {
            debug!(room = %room, %error, "subscribing to room outside the naming convention");
        }
    }
}
