//! Connection manager
//!
//! Owns every chat socket on this process: registration, the client frame
//! protocol, local fan-out, and the hand-off to the pub/sub bridge and the
//! presence tracker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use teamhub_shared::{
    ChatError, ChatId, ChatResult, MessageId, MessageStore, MessageType, NewMessage, UserId,
    WorkspaceId,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{CloseReason, Connection};
use super::events::{ClientEvent, Frame};
use super::room::Rooms;
use crate::auth::{AuthUser, TokenValidator};
use crate::presence::PresenceTracker;
use crate::pubsub::{EnvelopeSink, PubSubBridge};
use crate::read_state::{Acknowledgement, ReadStateEngine};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Which registry change a presence write follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceSync {
    Connected,
    Disconnected,
    Heartbeat,
}

/// Tunables for the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// How long shutdown waits for sockets to close
    pub shutdown_drain: Duration,
    /// Presence refresh period
    pub heartbeat_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            shutdown_drain: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// Statistics about local connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub active_connections: usize,
    pub active_chats: usize,
    pub subscriptions: usize,
}

struct ManagerInner {
    rooms: Arc<Rooms>,
    bridge: PubSubBridge,
    store: Arc<dyn MessageStore>,
    read_state: ReadStateEngine,
    presence: PresenceTracker,
    validator: Arc<dyn TokenValidator>,
    send_locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
    presence_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    settings: ManagerSettings,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Per-process registry of chat sockets. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        bridge: PubSubBridge,
        presence: PresenceTracker,
        validator: Arc<dyn TokenValidator>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                rooms: Arc::new(Rooms::new()),
                bridge,
                read_state: ReadStateEngine::new(Arc::clone(&store)),
                store,
                presence,
                validator,
                send_locks: Mutex::new(HashMap::new()),
                presence_locks: Mutex::new(HashMap::new()),
                settings,
                shutdown: CancellationToken::new(),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn read_state(&self) -> &ReadStateEngine {
        &self.inner.read_state
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn instance_id(&self) -> uuid::Uuid {
        self.inner.bridge.instance_id()
    }

    pub fn stats(&self) -> ManagerStats {
        let registry = self.inner.rooms.lock();
        ManagerStats {
            active_connections: registry.connection_count(),
            active_chats: registry.chat_count(),
            subscriptions: self.inner.bridge.subscription_count(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate a bearer token before the socket upgrade completes
    pub async fn authenticate(&self, token: &str) -> ChatResult<AuthUser> {
        let user = self.inner.validator.validate(token).await?;
        tracing::debug!(user_id = %user.user_id, "WebSocket token validated");
        Ok(user)
    }

    /// Register a socket for `user` on `chat_id`.
    ///
    /// Returns the connection handle and the receiving end of its outbound queue.
    pub async fn connect(
        &self,
        chat_id: ChatId,
        user: &AuthUser,
    ) -> ChatResult<(Arc<Connection>, mpsc::Receiver<Arc<str>>)> {
        if self.is_shutting_down() {
            return Err(ChatError::BusUnavailable("server shutting down".to_string()));
        }

        let chat = self
            .inner
            .store
            .chat(chat_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))?;

        if !self
            .inner
            .store
            .is_active_participant(chat_id, user.user_id)
            .await?
        {
            tracing::warn!(chat_id = %chat_id, user_id = %user.user_id, "Rejected non-participant connection");
            return Err(ChatError::Forbidden);
        }

        let (tx, rx) = mpsc::channel(self.inner.settings.outbound_buffer);
        let conn = Arc::new(Connection::new(
            chat_id,
            chat.workspace_id,
            user.user_id,
            user.user_name.clone(),
            tx,
        ));

        let registered = {
            let mut registry = self.inner.rooms.lock();
            let registered = registry.insert(Arc::clone(&conn));
            if registered.first_in_chat {
                let sink: Arc<dyn EnvelopeSink> = self.inner.rooms.clone();
                self.inner.bridge.subscribe(chat_id, sink);
            }
            registered
        };

        self.sync_presence(user.user_id, &[chat.workspace_id], PresenceSync::Connected)
            .await;

        if registered.first_for_user {
            let frame = Frame::user_joined(chat_id, user.user_id, user.user_name.clone());
            self.announce(chat_id, &frame, Some(user.user_id)).await;
        }

        tracing::info!(
            session_id = %conn.session_id,
            chat_id = %chat_id,
            user_id = %user.user_id,
            "WebSocket connection registered"
        );

        Ok((conn, rx))
    }

    /// Unregister a socket. Safe to call more than once.
    pub async fn disconnect(&self, conn: &Connection) {
        let outcome = {
            let mut registry = self.inner.rooms.lock();
            let outcome = registry.remove(conn);
            if outcome.as_ref().is_some_and(|o| o.last_in_chat) {
                self.inner.bridge.unsubscribe(conn.chat_id);
                self.inner
                    .send_locks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&conn.chat_id);
            }
            outcome
        };

        let Some(outcome) = outcome else {
            return;
        };
        conn.cancel();

        if outcome.last_for_user {
            let frame = Frame::user_left(conn.chat_id, conn.user_id, conn.user_name.clone());
            self.announce(conn.chat_id, &frame, Some(conn.user_id)).await;
        }

        if let Some(workspaces) = outcome.went_offline {
            self.sync_presence(conn.user_id, &workspaces, PresenceSync::Disconnected)
                .await;
        }

        tracing::info!(
            session_id = %conn.session_id,
            chat_id = %conn.chat_id,
            user_id = %conn.user_id,
            close_code = conn.close_reason().map(|r| r.code()),
            "WebSocket connection removed"
        );
    }

    /// Close every socket, wait for them to drain, then drop bus subscriptions
    /// and stop the presence heartbeat.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let connections = self.inner.rooms.lock().all_connections();
        tracing::info!(connections = connections.len(), "Closing WebSocket connections");
        for conn in &connections {
            conn.close(CloseReason::Shutdown);
        }

        let drained = tokio::time::timeout(self.inner.settings.shutdown_drain, async {
            while !self.inner.rooms.lock().is_empty() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            let leftover = self.inner.rooms.lock().all_connections();
            tracing::warn!(remaining = leftover.len(), "Shutdown drain timed out, forcing disconnect");
            for conn in &leftover {
                self.disconnect(conn).await;
            }
        }

        self.inner.bridge.unsubscribe_all();

        let heartbeat = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = heartbeat {
            task.abort();
        }

        tracing::info!("Connection manager stopped");
    }

    /// Spawn the presence heartbeat. Replaces a previously started one.
    pub fn start_heartbeat(&self) {
        let manager = self.clone();
        let period = self.inner.settings.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.refresh_presence().await,
                }
            }
        });

        let previous = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Refresh the presence entry of every user with a live local connection
    pub async fn refresh_presence(&self) {
        let live = self.inner.rooms.lock().live_presence();
        for (user_id, workspace_id) in &live {
            self.sync_presence(*user_id, &[*workspace_id], PresenceSync::Heartbeat)
                .await;
        }
        tracing::trace!(entries = live.len(), "Presence heartbeat");
    }

    /// Apply a presence write for `user_id`, re-checking the registry under a
    /// per-user lock so a write computed from an older registry state never
    /// lands after a newer one.
    async fn sync_presence(&self, user_id: UserId, workspaces: &[WorkspaceId], sync: PresenceSync) {
        let lock = self.presence_lock(user_id);
        {
            let _guard = lock.lock().await;
            for &workspace_id in workspaces {
                let (present, connections) = {
                    let registry = self.inner.rooms.lock();
                    (
                        registry.is_present(user_id, workspace_id),
                        registry.user_connection_count(user_id),
                    )
                };

                let presence = &self.inner.presence;
                let result = match sync {
                    PresenceSync::Connected if present => {
                        presence.set_online(user_id, workspace_id).await
                    }
                    PresenceSync::Heartbeat if present => presence.refresh(user_id, workspace_id).await,
                    PresenceSync::Disconnected if connections == 0 => presence
                        .set_offline(user_id, workspace_id)
                        .await
                        .map(|offline| {
                            if !offline {
                                tracing::debug!(user_id = %user_id, "User still connected elsewhere");
                            }
                        }),
                    _ => {
                        tracing::debug!(user_id = %user_id, ?sync, "Skipping stale presence write");
                        Ok(())
                    }
                };

                if let Err(e) = result {
                    tracing::warn!(error = %e, user_id = %user_id, ?sync, "Presence update failed");
                }
            }
        }
        self.release_presence_lock(user_id, lock);
    }

    fn presence_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .presence_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(user_id).or_default())
    }

    fn release_presence_lock(&self, user_id: UserId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .inner
            .presence_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Map entry plus this handle: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&user_id);
        }
    }

    // =========================================================================
    // Client frames
    // =========================================================================

    /// Handle one text frame from a client.
    ///
    /// Malformed and unknown frames are logged and ignored. Errors the client
    /// should know about are sent back as an ERROR frame on this socket only;
    /// `Forbidden` also closes the socket and is returned.
    pub async fn receive(&self, conn: &Arc<Connection>, text: &str) -> ChatResult<()> {
        let event = match Frame::decode(text).and_then(|f| ClientEvent::from_frame(f, conn.chat_id)) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(session_id = %conn.session_id, "Ignoring non-client frame");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(session_id = %conn.session_id, error = %e, "Ignoring malformed frame");
                return Ok(());
            }
        };

        match self.handle_event(conn, event).await {
            Ok(()) => Ok(()),
            Err(ChatError::Forbidden) => {
                tracing::warn!(
                    session_id = %conn.session_id,
                    user_id = %conn.user_id,
                    "Participant no longer active, closing socket"
                );
                conn.close(CloseReason::Forbidden);
                Err(ChatError::Forbidden)
            }
            Err(e) => {
                let (code, message) = match &e {
                    ChatError::Validation(msg) | ChatError::MalformedFrame(msg) => {
                        ("VALIDATION_ERROR", msg.clone())
                    }
                    ChatError::NotFound(what) => ("NOT_FOUND", format!("{what} not found")),
                    ChatError::Persistence(_) => {
                        ("PERSISTENCE_ERROR", "message could not be saved".to_string())
                    }
                    _ => ("INTERNAL_ERROR", "internal error".to_string()),
                };
                tracing::warn!(session_id = %conn.session_id, error = %e, "Client frame failed");

                let frame = Frame::error(conn.chat_id, code, &message);
                if let Ok(json) = frame.encode() {
                    conn.try_send(Arc::from(json));
                }
                Ok(())
            }
        }
    }

    async fn handle_event(&self, conn: &Arc<Connection>, event: ClientEvent) -> ChatResult<()> {
        if !self
            .inner
            .store
            .is_active_participant(conn.chat_id, conn.user_id)
            .await?
        {
            return Err(ChatError::Forbidden);
        }

        match event {
            ClientEvent::Message {
                content,
                message_type,
                file_url,
                file_name,
                file_size,
            } => {
                if message_type == MessageType::Text && content.trim().is_empty() {
                    return Err(ChatError::Validation("message content must not be empty".to_string()));
                }
                let new_message = NewMessage {
                    chat_id: conn.chat_id,
                    sender_id: conn.user_id,
                    content,
                    message_type,
                    file_url,
                    file_name,
                    file_size,
                };
                self.send_message(new_message, conn.user_name.clone()).await
            }
            ClientEvent::TypingStart => {
                self.typing(conn, true).await;
                Ok(())
            }
            ClientEvent::TypingStop => {
                self.typing(conn, false).await;
                Ok(())
            }
            ClientEvent::ReadMessage { message_id } => self.read(conn, message_id).await,
        }
    }

    /// Persist, deliver locally, then publish. Serialized per chat so local
    /// observers see messages in persisted order.
    async fn send_message(&self, new_message: NewMessage, sender_name: Option<String>) -> ChatResult<()> {
        let chat_id = new_message.chat_id;
        let send_lock = self.send_lock(chat_id);
        let _guard = send_lock.lock().await;

        let message = self.inner.store.insert_message(new_message).await?;
        let frame = Frame::message_received(&message, sender_name);

        let recipients = self.inner.rooms.broadcast(chat_id, &frame, None);
        if let Err(e) = self.inner.bridge.publish(chat_id, &frame).await {
            tracing::warn!(chat_id = %chat_id, message_id = %message.id, error = %e, "Failed to publish message");
        }

        tracing::debug!(
            chat_id = %chat_id,
            message_id = %message.id,
            local_recipients = recipients,
            "Message delivered"
        );
        Ok(())
    }

    async fn typing(&self, conn: &Connection, is_typing: bool) {
        let frame = Frame::user_typing(conn.chat_id, conn.user_id, conn.user_name.clone(), is_typing);
        self.inner.rooms.broadcast(conn.chat_id, &frame, Some(conn.user_id));

        if let Err(e) = self.inner.bridge.publish(conn.chat_id, &frame).await {
            tracing::debug!(chat_id = %conn.chat_id, error = %e, "Dropped typing indicator");
        }
    }

    async fn read(&self, conn: &Connection, message_id: Option<MessageId>) -> ChatResult<()> {
        if let Some(message_id) = message_id {
            let owner = self.inner.store.message_chat_id(message_id).await?;
            if owner != Some(conn.chat_id) {
                return Err(ChatError::Validation(
                    "message belongs to another chat".to_string(),
                ));
            }
        }

        let watermark = self.inner.read_state.mark_read(conn.chat_id, conn.user_id).await?;

        let read_at = match message_id {
            Some(message_id) => {
                self.inner
                    .read_state
                    .acknowledge_message(message_id, conn.user_id)
                    .await?
                    .read_at
            }
            None => watermark,
        };

        let frame = Frame::message_read(conn.chat_id, conn.user_id, message_id, read_at);
        self.announce(conn.chat_id, &frame, None).await;
        Ok(())
    }

    // =========================================================================
    // Used by the REST surface
    // =========================================================================

    /// Advance the caller's watermark and tell the chat
    pub async fn mark_read(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<OffsetDateTime> {
        let watermark = self.inner.read_state.mark_read(chat_id, user_id).await?;
        let frame = Frame::message_read(chat_id, user_id, None, watermark);
        self.announce(chat_id, &frame, None).await;
        Ok(watermark)
    }

    /// Record a receipt and tell the message's chat
    pub async fn acknowledge_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> ChatResult<Acknowledgement> {
        let ack = self
            .inner
            .read_state
            .acknowledge_message(message_id, user_id)
            .await?;
        let frame = Frame::message_read(ack.chat_id, user_id, Some(message_id), ack.read_at);
        self.announce(ack.chat_id, &frame, None).await;
        Ok(ack)
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver locally (optionally skipping one user's sockets), then publish
    async fn announce(&self, chat_id: ChatId, frame: &Frame, skip_user: Option<UserId>) {
        self.inner.rooms.broadcast(chat_id, frame, skip_user);
        if let Err(e) = self.inner.bridge.publish(chat_id, frame).await {
            tracing::warn!(chat_id = %chat_id, frame_type = ?frame.frame_type, error = %e, "Failed to publish frame");
        }
    }

    fn send_lock(&self, chat_id: ChatId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .send_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(chat_id).or_default())
    }
}
