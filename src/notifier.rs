//! Fan-out of lifecycle and presence events to live connections.
//!
//! Every user has a broadcast room keyed by user id; each websocket joined as
//! that user holds one receiver.  A user is live while their room has at
//! least one receiver.  Events are not persisted, a user who is offline
//! misses them and a new message falls back to push instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::ledger::Ledger;
use crate::logging;
use crate::model::VoiceMessage;
use crate::presence::PresenceStore;
use crate::push::{deliver_push, PushPayload, PushSender};

pub const ROOM_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Opened,
    Closed,
}

/// Where a chat status change should be shown: the friends list badge, or
/// the open chat window (only when both sides have each other open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatContext {
    FriendsList,
    ChatWindow,
}

/// Events pushed to live connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: VoiceMessage,
    },
    MessageRead {
        message: VoiceMessage,
    },
    UnreadCountsChanged {
        user_id: String,
    },
    ChatStatus {
        friend_id: String,
        status: ChatState,
        context: ChatContext,
    },
    MessageDeleted {
        message_id: String,
    },
    /// Written by the websocket layer when a slow connection fell behind.
    EventsMissed {
        count: u64,
    },
}

pub struct Notifier {
    rooms: RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>,
    presence: Arc<dyn PresenceStore>,
    push: Arc<dyn PushSender>,
    ledger: Arc<Ledger>,
}

impl Notifier {
    pub fn new(
        ledger: Arc<Ledger>,
        presence: Arc<dyn PresenceStore>,
        push: Arc<dyn PushSender>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            presence,
            push,
            ledger,
        }
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<ServerEvent> {
        let rooms = self.rooms.read().await;
        if let Some(tx) = rooms.get(user_id) {
            return tx.subscribe();
        }
        drop(rooms);

        let mut rooms = self.rooms.write().await;
        let tx = rooms
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0);
        tx.subscribe()
    }

    /// Bind `connection_id` to `user_id` and join the user's room.
    pub async fn join(&self, connection_id: &str, user_id: &str) -> broadcast::Receiver<ServerEvent> {
        self.presence.bind(connection_id, user_id);
        let rx = self.subscribe(user_id).await;
        tracing::debug!(user = %logging::user_id(user_id), connection_id, "joined room");
        rx
    }

    /// Drop the user's room once its last receiver is gone.
    pub async fn prune_room(&self, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(user_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            rooms.remove(user_id);
        }
    }

    /// Send an event to every live connection of `user_id`.  Returns the
    /// number of receivers reached.
    pub async fn emit_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let rooms = self.rooms.read().await;
        match rooms.get(user_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub async fn is_live(&self, user_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(user_id)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    async fn emit_to_pair(&self, a: &str, b: &str, event: ServerEvent) {
        self.emit_to_user(a, event.clone()).await;
        if a != b {
            self.emit_to_user(b, event).await;
        }
    }

    async fn emit_counts_changed(&self, a: &str, b: &str) {
        self.emit_to_user(
            a,
            ServerEvent::UnreadCountsChanged {
                user_id: a.to_string(),
            },
        )
        .await;
        if a != b {
            self.emit_to_user(
                b,
                ServerEvent::UnreadCountsChanged {
                    user_id: b.to_string(),
                },
            )
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    /// Announce a new message to both participants.  When the receiver has
    /// no live connection a push delivery is started in the background and
    /// its handle returned.
    pub async fn notify_new_message(&self, message: &VoiceMessage) -> Option<JoinHandle<()>> {
        let receiver_live = self.is_live(&message.receiver_id).await;

        self.emit_to_pair(
            &message.receiver_id,
            &message.sender_id,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;
        self.emit_counts_changed(&message.receiver_id, &message.sender_id)
            .await;

        if receiver_live {
            return None;
        }

        let ledger = Arc::clone(&self.ledger);
        let push = Arc::clone(&self.push);
        let receiver_id = message.receiver_id.clone();
        let payload = PushPayload::new_voice_message(&message.sender_id);
        Some(tokio::spawn(async move {
            match deliver_push(&ledger, &push, &receiver_id, &payload).await {
                Ok(report) => tracing::debug!(
                    user = %logging::user_id(&receiver_id),
                    delivered = report.delivered,
                    gone = report.gone,
                    failed = report.failed,
                    "push fallback finished"
                ),
                Err(e) => tracing::warn!(
                    user = %logging::user_id(&receiver_id),
                    error = %e,
                    "push fallback failed"
                ),
            }
        }))
    }

    pub async fn notify_message_read(&self, message: &VoiceMessage) {
        self.emit_to_pair(
            &message.sender_id,
            &message.receiver_id,
            ServerEvent::MessageRead {
                message: message.clone(),
            },
        )
        .await;
        self.emit_counts_changed(&message.sender_id, &message.receiver_id)
            .await;
    }

    pub async fn notify_message_deleted(&self, message: &VoiceMessage) {
        self.emit_to_pair(
            &message.sender_id,
            &message.receiver_id,
            ServerEvent::MessageDeleted {
                message_id: message.id.clone(),
            },
        )
        .await;
        self.emit_counts_changed(&message.sender_id, &message.receiver_id)
            .await;
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    async fn emit_chat_status(&self, user_id: &str, partner_id: &str, status: ChatState, mutual: bool) {
        let mut contexts = vec![ChatContext::FriendsList];
        if mutual {
            contexts.push(ChatContext::ChatWindow);
        }
        for context in contexts {
            self.emit_to_user(
                partner_id,
                ServerEvent::ChatStatus {
                    friend_id: user_id.to_string(),
                    status,
                    context,
                },
            )
            .await;
            self.emit_to_user(
                user_id,
                ServerEvent::ChatStatus {
                    friend_id: partner_id.to_string(),
                    status,
                    context,
                },
            )
            .await;
        }
    }

    pub async fn chat_opened(&self, user_id: &str, partner_id: &str) {
        let mutual = self.presence.open_chat(user_id, partner_id);
        tracing::debug!(
            user = %logging::user_id(user_id),
            partner = %logging::user_id(partner_id),
            mutual,
            "chat opened"
        );
        self.emit_chat_status(user_id, partner_id, ChatState::Opened, mutual)
            .await;
    }

    pub async fn chat_closed(&self, user_id: &str, partner_id: &str) {
        let mutual = self.presence.close_chat(user_id, partner_id);
        tracing::debug!(
            user = %logging::user_id(user_id),
            partner = %logging::user_id(partner_id),
            mutual,
            "chat closed"
        );
        self.emit_chat_status(user_id, partner_id, ChatState::Closed, mutual)
            .await;
    }

    /// Tear down a connection: close any chat its user had open and forget
    /// the binding.  The caller must have dropped its room receiver first so
    /// an emptied room can be pruned.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(departure) = self.presence.disconnect(connection_id) else {
            return;
        };
        if let Some(partner_id) = &departure.partner_id {
            self.emit_chat_status(
                &departure.user_id,
                partner_id,
                ChatState::Closed,
                departure.mutual,
            )
            .await;
        }
        self.prune_room(&departure.user_id).await;
        tracing::debug!(
            user = %logging::user_id(&departure.user_id),
            connection_id = %connection_id,
            "connection left"
        );
    }
}
