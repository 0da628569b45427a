//! Chat room registry
//!
//! Maps chats to the connections registered on this process and keeps the
//! per-user counters that decide USER_JOINED / USER_LEFT and presence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use teamhub_shared::{ChatId, SessionId, UserId, WorkspaceId};

use super::connection::{CloseReason, Connection};
use super::events::{Frame, FrameType};
use crate::pubsub::EnvelopeSink;

/// What a registration changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    /// First local connection for the chat: the bus channel must be subscribed
    pub first_in_chat: bool,
    /// User had no other connection to this chat
    pub first_for_user: bool,
}

/// What an unregistration changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// No local connection left for the chat: the bus channel can be dropped
    pub last_in_chat: bool,
    /// User has no other connection to this chat
    pub last_for_user: bool,
    /// Set when the user has no connection left on this process: every
    /// workspace their connections touched
    pub went_offline: Option<Vec<WorkspaceId>>,
}

/// Connection bookkeeping. Plain data; callers hold the lock in [`Rooms`].
#[derive(Debug, Default)]
pub struct Registry {
    chats: HashMap<ChatId, HashMap<SessionId, Arc<Connection>>>,
    per_user_chat: HashMap<(ChatId, UserId), usize>,
    per_user: HashMap<UserId, usize>,
    per_user_workspace: HashMap<(UserId, WorkspaceId), usize>,
    user_workspaces: HashMap<UserId, HashSet<WorkspaceId>>,
}

impl Registry {
    pub fn insert(&mut self, conn: Arc<Connection>) -> Registered {
        let (chat_id, user_id) = (conn.chat_id, conn.user_id);

        let sessions = self.chats.entry(chat_id).or_default();
        let first_in_chat = sessions.is_empty();
        sessions.insert(conn.session_id, Arc::clone(&conn));

        let user_count = self.per_user_chat.entry((chat_id, user_id)).or_insert(0);
        *user_count += 1;
        let first_for_user = *user_count == 1;

        *self.per_user.entry(user_id).or_insert(0) += 1;
        *self
            .per_user_workspace
            .entry((user_id, conn.workspace_id))
            .or_insert(0) += 1;
        self.user_workspaces
            .entry(user_id)
            .or_default()
            .insert(conn.workspace_id);

        tracing::debug!(
            chat_id = %chat_id,
            session_id = %conn.session_id,
            room_size = sessions.len(),
            "Connection joined chat room"
        );

        Registered {
            first_in_chat,
            first_for_user,
        }
    }

    /// Remove a connection. `None` if it was not registered.
    pub fn remove(&mut self, conn: &Connection) -> Option<Unregistered> {
        let (chat_id, user_id) = (conn.chat_id, conn.user_id);

        let sessions = self.chats.get_mut(&chat_id)?;
        sessions.remove(&conn.session_id)?;

        let last_in_chat = sessions.is_empty();
        if last_in_chat {
            self.chats.remove(&chat_id);
            tracing::debug!(chat_id = %chat_id, "Removed empty chat room");
        }

        let last_for_user = decrement(&mut self.per_user_chat, (chat_id, user_id));
        decrement(&mut self.per_user_workspace, (user_id, conn.workspace_id));
        let went_offline = if decrement(&mut self.per_user, user_id) {
            self.user_workspaces
                .remove(&user_id)
                .map(|set| set.into_iter().collect())
                .or_else(|| Some(vec![conn.workspace_id]))
        } else {
            None
        };

        Some(Unregistered {
            last_in_chat,
            last_for_user,
            went_offline,
        })
    }

    pub fn connections(&self, chat_id: ChatId) -> Vec<Arc<Connection>> {
        self.chats
            .get(&chat_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.chats
            .values()
            .flat_map(|sessions| sessions.values().cloned())
            .collect()
    }

    /// Distinct (user, workspace) pairs with a live connection
    pub fn live_presence(&self) -> Vec<(UserId, WorkspaceId)> {
        let pairs: HashSet<(UserId, WorkspaceId)> = self
            .chats
            .values()
            .flat_map(|sessions| sessions.values())
            .map(|conn| (conn.user_id, conn.workspace_id))
            .collect();
        pairs.into_iter().collect()
    }

    /// User has a live connection to some chat of the workspace
    pub fn is_present(&self, user_id: UserId, workspace_id: WorkspaceId) -> bool {
        self.per_user_workspace.contains_key(&(user_id, workspace_id))
    }

    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.per_user.get(&user_id).copied().unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.chats.values().map(HashMap::len).sum()
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

/// Decrement a counter, dropping it at zero. Returns true when it reached zero.
fn decrement<K: std::hash::Hash + Eq>(counts: &mut HashMap<K, usize>, key: K) -> bool {
    match counts.get_mut(&key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            counts.remove(&key);
            true
        }
        None => true,
    }
}

/// Registry behind its lock, plus local fan-out
#[derive(Debug, Default)]
pub struct Rooms {
    registry: Mutex<Registry>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry, recovering from poisoning
    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a frame to every local connection of the chat except `skip_user`'s.
    ///
    /// Enqueueing never blocks; a connection whose queue is full or closed is
    /// closed as a slow consumer without affecting the others. Returns the number
    /// of connections the frame was queued for.
    pub fn broadcast(&self, chat_id: ChatId, frame: &Frame, skip_user: Option<UserId>) -> usize {
        let encoded: Arc<str> = match frame.encode() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(error = %e, chat_id = %chat_id, "Failed to encode frame");
                return 0;
            }
        };

        let targets = self.lock().connections(chat_id);
        let mut delivered = 0;
        let mut dropped = 0;

        for conn in targets {
            if Some(conn.user_id) == skip_user || conn.is_closed() {
                continue;
            }
            if conn.try_send(Arc::clone(&encoded)) {
                delivered += 1;
            } else {
                dropped += 1;
                conn.close(CloseReason::SlowConsumer);
            }
        }

        tracing::debug!(
            chat_id = %chat_id,
            frame_type = ?frame.frame_type,
            recipients = delivered,
            dropped = dropped,
            "Broadcast frame to chat room"
        );

        delivered
    }
}

impl EnvelopeSink for Rooms {
    fn deliver(&self, chat_id: ChatId, frame: Frame) {
        // Typists never see their own indicator, on any device
        let skip_user = match frame.frame_type {
            FrameType::UserTyping => frame.user_id,
            _ => None,
        };
        self.broadcast(chat_id, &frame, skip_user);
    }
}
