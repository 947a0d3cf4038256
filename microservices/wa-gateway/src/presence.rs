//! Presence / push gateway
//!
//! In-memory operator-to-connection registry with a single active
//! connection per operator (newest wins). Rebuilt empty on restart; the
//! client re-syncs on join.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;
use zapgate_core::{MessageDirection, MessageStatus};

use crate::model::{Conversation, Message};

/// Events pushed to operator clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    #[serde(rename = "new_conversation")]
    NewConversation { conversation: Conversation },

    #[serde(rename = "new_message")]
    NewMessage {
        conversation_id: Uuid,
        message: Message,
    },

    #[serde(rename = "message:status")]
    MessageStatusChanged {
        conversation_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
        direction: MessageDirection,
    },

    #[serde(rename = "conversation:unassigned")]
    ConversationUnassigned { conversation_id: Uuid },

    #[serde(rename = "operator:conversations")]
    OperatorConversations { conversations: Vec<Conversation> },

    #[serde(rename = "typing")]
    Typing {
        conversation_id: Uuid,
        operator_id: Uuid,
        is_typing: bool,
    },
}

struct OperatorConnection {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<PushEvent>,
}

/// Registry mapping operator identity to its live connection plus named
/// conversation rooms for typing indicators.
#[derive(Default)]
pub struct PresenceGateway {
    connections: DashMap<Uuid, OperatorConnection>,
    rooms: DashMap<String, HashSet<Uuid>>,
}

impl PresenceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator connection; an existing connection for the
    /// same operator is replaced (its receiver closes).
    pub fn register(&self, operator_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        self.connections.insert(
            operator_id,
            OperatorConnection {
                connection_id,
                sender: tx,
            },
        );
        (connection_id, rx)
    }

    /// Remove a connection, but only if it is still the active one; a
    /// stale disconnect must not kick a replacement connection.
    pub fn unregister(&self, operator_id: Uuid, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(&operator_id, |_, conn| conn.connection_id == connection_id)
            .is_some();
        if removed {
            for mut room in self.rooms.iter_mut() {
                room.value_mut().remove(&operator_id);
            }
        }
        removed
    }

    pub fn is_online(&self, operator_id: Uuid) -> bool {
        self.connections.contains_key(&operator_id)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    /// Push to one operator; returns whether a live connection took it.
    pub fn push_to_operator(&self, operator_id: Uuid, event: PushEvent) -> bool {
        match self.connections.get(&operator_id) {
            Some(conn) => conn.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Push to every connected operator.
    pub fn broadcast(&self, event: PushEvent) {
        for conn in self.connections.iter() {
            let _ = conn.sender.send(event.clone());
        }
    }

    pub fn join_room(&self, room: &str, operator_id: Uuid) {
        self.rooms.entry(room.to_string()).or_default().insert(operator_id);
    }

    pub fn leave_room(&self, room: &str, operator_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&operator_id);
        }
    }

    /// Push to all members of a named room except the sender.
    pub fn push_to_room(&self, room: &str, from: Uuid, event: PushEvent) {
        let members: Vec<Uuid> = match self.rooms.get(room) {
            Some(members) => members.iter().copied().filter(|id| *id != from).collect(),
            None => return,
        };
        for member in members {
            self.push_to_operator(member, event.clone());
        }
    }
}

/// The room name for a conversation's typing indicators.
pub fn conversation_room(conversation_id: Uuid) -> String {
    format!("conversation:{}", conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_reaches_registered_operator() {
        let gateway = PresenceGateway::new();
        let operator = Uuid::new_v4();
        let (_, mut rx) = gateway.register(operator);

        assert!(gateway.push_to_operator(
            operator,
            PushEvent::ConversationUnassigned {
                conversation_id: Uuid::new_v4()
            }
        ));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn push_to_unknown_operator_is_false() {
        let gateway = PresenceGateway::new();
        assert!(!gateway.push_to_operator(
            Uuid::new_v4(),
            PushEvent::ConversationUnassigned {
                conversation_id: Uuid::new_v4()
            }
        ));
    }

    #[tokio::test]
    async fn newest_connection_wins() {
        let gateway = PresenceGateway::new();
        let operator = Uuid::new_v4();
        let (first_id, mut first_rx) = gateway.register(operator);
        let (_, mut second_rx) = gateway.register(operator);

        gateway.push_to_operator(
            operator,
            PushEvent::ConversationUnassigned {
                conversation_id: Uuid::new_v4(),
            },
        );

        // First receiver's sender was dropped on replacement
        assert!(first_rx.recv().await.is_none());
        assert!(second_rx.recv().await.is_some());

        // Stale disconnect of the replaced connection is a no-op
        assert!(!gateway.unregister(operator, first_id));
        assert!(gateway.is_online(operator));
    }

    #[tokio::test]
    async fn room_push_skips_sender() {
        let gateway = PresenceGateway::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_, mut alice_rx) = gateway.register(alice);
        let (_, mut bob_rx) = gateway.register(bob);

        let room = conversation_room(Uuid::new_v4());
        gateway.join_room(&room, alice);
        gateway.join_room(&room, bob);

        gateway.push_to_room(
            &room,
            alice,
            PushEvent::Typing {
                conversation_id: Uuid::new_v4(),
                operator_id: alice,
                is_typing: true,
            },
        );

        assert!(bob_rx.recv().await.is_some());
        assert!(alice_rx.try_recv().is_err());
    }
}
