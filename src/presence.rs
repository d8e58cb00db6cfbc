//! Ephemeral presence and chat-open state.
//!
//! Tracks which user owns each live connection and which partner each user
//! currently has a chat window open with.  Nothing here survives a restart.

use std::collections::HashMap;
use std::sync::Mutex;

/// Result of dropping a connection that had an open chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: String,
    /// The partner the user had open when the connection dropped.
    pub partner_id: Option<String>,
    /// Whether the partner had the user open at the same time.
    pub mutual: bool,
}

pub trait PresenceStore: Send + Sync {
    /// Associate a connection with a user.  Rebinding replaces the old user.
    fn bind(&self, connection_id: &str, user_id: &str);

    /// Record that `user_id` opened a chat with `partner_id`.  Returns whether
    /// the partner has `user_id` open as well.
    fn open_chat(&self, user_id: &str, partner_id: &str) -> bool;

    /// Clear `user_id`'s open chat.  Returns whether `partner_id` had
    /// `user_id` open, evaluated before the mapping is removed.
    fn close_chat(&self, user_id: &str, partner_id: &str) -> bool;

    /// Forget a connection and its user's chat state.  `None` when the
    /// connection was never bound.
    fn disconnect(&self, connection_id: &str) -> Option<Departure>;

    fn open_partner(&self, user_id: &str) -> Option<String>;

    fn user_of(&self, connection_id: &str) -> Option<String>;
}

#[derive(Default)]
struct PresenceMaps {
    connections: HashMap<String, String>,
    open_chats: HashMap<String, String>,
}

/// Process-local presence.  Both maps sit behind one lock so mutual checks
/// and updates are consistent with each other.
#[derive(Default)]
pub struct InMemoryPresence {
    maps: Mutex<PresenceMaps>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_maps<R>(&self, f: impl FnOnce(&mut PresenceMaps) -> R) -> R {
        // A panic while holding the lock cannot leave the maps half-updated,
        // so a poisoned lock is still usable.
        let mut guard = match self.maps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl PresenceStore for InMemoryPresence {
    fn bind(&self, connection_id: &str, user_id: &str) {
        self.with_maps(|maps| {
            maps.connections
                .insert(connection_id.to_string(), user_id.to_string());
        });
    }

    fn open_chat(&self, user_id: &str, partner_id: &str) -> bool {
        self.with_maps(|maps| {
            maps.open_chats
                .insert(user_id.to_string(), partner_id.to_string());
            maps.open_chats.get(partner_id).map(String::as_str) == Some(user_id)
        })
    }

    fn close_chat(&self, user_id: &str, partner_id: &str) -> bool {
        self.with_maps(|maps| {
            let mutual = maps.open_chats.get(partner_id).map(String::as_str) == Some(user_id);
            maps.open_chats.remove(user_id);
            mutual
        })
    }

    fn disconnect(&self, connection_id: &str) -> Option<Departure> {
        self.with_maps(|maps| {
            let user_id = maps.connections.remove(connection_id)?;
            let partner_id = maps.open_chats.remove(&user_id);
            let mutual = partner_id
                .as_ref()
                .and_then(|p| maps.open_chats.get(p))
                .map(String::as_str)
                == Some(user_id.as_str());
            Some(Departure {
                user_id,
                partner_id,
                mutual,
            })
        })
    }

    fn open_partner(&self, user_id: &str) -> Option<String> {
        self.with_maps(|maps| maps.open_chats.get(user_id).cloned())
    }

    fn user_of(&self, connection_id: &str) -> Option<String> {
        self.with_maps(|maps| maps.connections.get(connection_id).cloned())
    }
}
