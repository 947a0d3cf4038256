//! Realtime operator channel
//!
//! Connect with the shared secret, join with an operator identity, get
//! the open-conversation snapshot, then receive pushes until disconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;
use zapgate_core::ConversationStatus;

use crate::presence::{conversation_room, PushEvent};
use crate::store::Store;

use super::AppState;

/// Client-to-server messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "operator:join")]
    Join { operator_id: Uuid },
    #[serde(rename = "operator:leave")]
    Leave,
    #[serde(rename = "typing")]
    Typing {
        conversation_id: Uuid,
        is_typing: bool,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    secret: Option<String>,
}

/// WebSocket upgrade; an invalid secret never upgrades.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.secret.as_deref() != Some(state.config.api_secret.as_str()) {
        return (StatusCode::UNAUTHORIZED, "invalid secret").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // First meaningful frame must be operator:join
    let operator_id = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Join { operator_id }) => break operator_id,
                    Ok(_) | Err(_) => {}
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            _ => {}
        }
    };

    match state.store.get_operator(operator_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "Operator lookup failed on join");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    let (connection_id, mut events) = state.presence.register(operator_id);
    if let Err(e) = state
        .store
        .set_operator_presence(operator_id, true, Utc::now())
        .await
    {
        warn!(error = %e, %operator_id, "Could not mark operator online");
    }
    debug!(%operator_id, %connection_id, "Operator joined");

    // Initial snapshot of this operator's open conversations
    let conversations = state
        .store
        .list_conversations(Some(operator_id), Some(ConversationStatus::Open))
        .await
        .unwrap_or_default();
    for conversation in &conversations {
        state
            .presence
            .join_room(&conversation_room(conversation.id), operator_id);
    }
    if send_event(&mut sender, &PushEvent::OperatorConversations { conversations })
        .await
        .is_err()
    {
        cleanup(&state, operator_id, connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                // Replaced by a newer connection for the same operator
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Typing { conversation_id, is_typing }) => {
                            let room = conversation_room(conversation_id);
                            state.presence.join_room(&room, operator_id);
                            state.presence.push_to_room(
                                &room,
                                operator_id,
                                PushEvent::Typing {
                                    conversation_id,
                                    operator_id,
                                    is_typing,
                                },
                            );
                        }
                        Ok(ClientMessage::Leave) => break,
                        Ok(ClientMessage::Join { .. }) | Ok(ClientMessage::Ping) | Err(_) => {}
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    cleanup(&state, operator_id, connection_id).await;
    debug!(%operator_id, "Operator disconnected");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &PushEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn cleanup(state: &AppState, operator_id: Uuid, connection_id: Uuid) {
    // Only the still-active connection flips presence; a replaced socket
    // must not mark the operator offline.
    if state.presence.unregister(operator_id, connection_id) {
        if let Err(e) = state
            .store
            .set_operator_presence(operator_id, false, Utc::now())
            .await
        {
            warn!(error = %e, %operator_id, "Could not mark operator offline");
        }
    }
}
