//! WebSocket connection handle
//!
//! One per open socket. The socket's writer task drains the outbound queue and
//! watches the cancellation token; everyone else only ever enqueues.

use std::sync::{Arc, OnceLock};
use teamhub_shared::{ChatId, SessionId, UserId, WorkspaceId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why the server closed a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Not (or no longer) a participant of the chat
    Forbidden,
    /// Process is shutting down
    Shutdown,
    /// Outbound queue overflowed
    SlowConsumer,
    /// Connection could not be set up
    Internal,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Forbidden => 4403,
            CloseReason::Shutdown => 1001,
            CloseReason::SlowConsumer => 1008,
            CloseReason::Internal => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Forbidden => "forbidden",
            CloseReason::Shutdown => "server shutting down",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Internal => "internal error",
        }
    }
}

/// Represents an active WebSocket connection bound to one chat
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: SessionId,

    pub chat_id: ChatId,
    pub workspace_id: WorkspaceId,

    /// Authenticated user
    pub user_id: UserId,
    pub user_name: Option<String>,

    /// Bounded queue of encoded frames for the writer task
    sender: mpsc::Sender<Arc<str>>,

    cancel: CancellationToken,
    close_reason: OnceLock<CloseReason>,
}

impl Connection {
    pub fn new(
        chat_id: ChatId,
        workspace_id: WorkspaceId,
        user_id: UserId,
        user_name: Option<String>,
        sender: mpsc::Sender<Arc<str>>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            chat_id,
            workspace_id,
            user_id,
            user_name,
            sender,
            cancel: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Enqueue an encoded frame without waiting.
    ///
    /// Returns false if the queue is full or the writer is gone.
    pub fn try_send(&self, frame: Arc<str>) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    chat_id = %self.chat_id,
                    "Outbound queue full"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the socket tasks to close with `reason`. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_ok() {
            tracing::debug!(
                session_id = %self.session_id,
                code = reason.code(),
                "Closing connection"
            );
        }
        self.cancel.cancel();
    }

    /// Stop the socket tasks without a close frame
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed or cancelled
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn connection(buffer: usize) -> (Connection, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(buffer);
        let conn = Connection::new(ChatId::new(), WorkspaceId::new(), UserId::new(), None, tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn test_try_send_never_blocks() {
        let (conn, mut rx) = connection(1);

        assert!(conn.try_send(Arc::from("one")));
        assert!(!conn.try_send(Arc::from("two")));
        assert_eq!(&*rx.recv().await.unwrap(), "one");

        drop(rx);
        assert!(!conn.try_send(Arc::from("three")));
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (conn, _rx) = connection(4);
        assert!(!conn.is_closed());

        conn.close(CloseReason::SlowConsumer);
        conn.close(CloseReason::Shutdown);

        conn.closed().await;
        assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(conn.close_reason().unwrap().code(), 1008);
    }
}
