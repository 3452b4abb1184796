//! The relay facade: the operations collaborators call.
//!
//! Wires the presence state, supervisor and router together with the user
//! directory and message store, and implements the message-level use cases
//! (send, mark read, typing) on top of them.

use crate::config::ServerConfig;
use crate::presence::PresenceState;
use crate::router::DeliveryRouter;
use crate::session::auth_gate::DEFAULT_AUTH_WINDOW;
use crate::session::{AuthGate, AuthGrant, Outbox, SessionSupervisor, SupervisorStats};
use crate::store::{MessageStore, StoredMessage, UserDirectory};
use chrono::{DateTime, Utc};
use herald_core::{
    CloseReason, HeraldError, HeraldResult, MessageId, ServerEvent, SessionId, UserId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for the in-memory relay.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub auth_timeout: Duration,
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub queue_cap: Option<usize>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_WINDOW,
            max_connections: 10_000,
            outbound_buffer: 256,
            queue_cap: None,
        }
    }
}

impl From<&ServerConfig> for RelaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout,
            max_connections: config.max_connections,
            outbound_buffer: config.outbound_buffer,
            queue_cap: config.queue_cap,
        }
    }
}

/// Outcome of `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of `mark_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Marked,
    AlreadyRead,
}

impl ReadOutcome {
    pub fn message(self) -> &'static str {
        match self {
            ReadOutcome::Marked => "Message marked as read",
            ReadOutcome::AlreadyRead => "Message already marked as read",
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    supervisor: SessionSupervisor,
    router: DeliveryRouter,
    users: Arc<dyn UserDirectory>,
    messages: Arc<dyn MessageStore>,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        users: Arc<dyn UserDirectory>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let state = PresenceState::shared(settings.queue_cap);
        let supervisor = SessionSupervisor::new(
            state.clone(),
            AuthGate::new(settings.auth_timeout),
            users.clone(),
            settings.max_connections,
            settings.outbound_buffer,
        );
        let router = DeliveryRouter::new(state);
        Self {
            supervisor,
            router,
            users,
            messages,
        }
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &DeliveryRouter {
        &self.router
    }

    /// Accept a transport connection.
    pub async fn connect(&self, remote: Option<SocketAddr>) -> HeraldResult<(SessionId, Outbox)> {
        self.supervisor.connect(remote).await
    }

    pub async fn authenticate(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> HeraldResult<AuthGrant> {
        self.supervisor.authenticate(session_id, user_id).await
    }

    pub async fn disconnect(&self, session_id: &SessionId, reason: CloseReason) -> bool {
        self.supervisor.disconnect(session_id, reason).await
    }

    /// Persist a message and route it to the receiver.
    pub async fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> HeraldResult<SendReceipt> {
        if content.trim().is_empty() {
            return Err(HeraldError::InvalidMessage("content is required".into()));
        }
        for user_id in [sender_id, receiver_id] {
            if !self.users.user_exists(user_id).await? {
                return Err(HeraldError::IdentityNotFound(user_id));
            }
        }

        let stored = self
            .messages
            .persist_message(sender_id, receiver_id, content)
            .await?;
        let delivery = self
            .router
            .send_to_user(receiver_id, new_message_event(&stored))
            .await;
        info!(
            message_id = %stored.id,
            sender = %sender_id,
            receiver = %receiver_id,
            delivered = delivery.is_delivered(),
            "message sent"
        );

        Ok(SendReceipt {
            message_id: stored.id,
            delivered: delivery.is_delivered(),
            created_at: stored.created_at,
        })
    }

    /// Mark a message read on behalf of its receiver and notify the sender.
    ///
    /// The sender notification is best effort; its failure never fails the call.
    pub async fn mark_read(
        &self,
        message_id: MessageId,
        reader_id: UserId,
    ) -> HeraldResult<ReadOutcome> {
        let message = self
            .messages
            .find_message(message_id)
            .await?
            .ok_or(HeraldError::MessageNotFound(message_id))?;

        if message.receiver_id != reader_id {
            warn!(message_id = %message_id, reader = %reader_id, "mark_read refused: not the receiver");
            return Err(HeraldError::NotAuthorized(format!(
                "user {reader_id} cannot mark message {message_id} as read"
            )));
        }
        if message.is_read || !self.messages.set_message_read(message_id).await? {
            return Ok(ReadOutcome::AlreadyRead);
        }
        info!(message_id = %message_id, reader = %reader_id, "message marked as read");

        let receipt = self
            .router
            .send_read_receipt(message.sender_id, message_id, reader_id)
            .await;
        if !receipt.is_delivered() {
            debug!(message_id = %message_id, sender = %message.sender_id, "sender offline, read receipt queued");
        }
        Ok(ReadOutcome::Marked)
    }

    /// Forward a typing indicator. Never fails once the request is well formed.
    pub async fn send_typing(&self, sender_id: UserId, receiver_id: UserId) -> HeraldResult<()> {
        if sender_id == receiver_id {
            return Err(HeraldError::InvalidMessage("cannot send typing to self".into()));
        }
        self.router.send_typing(sender_id, receiver_id).await;
        Ok(())
    }

    /// Message history between two users, oldest first.
    pub async fn conversation(&self, a: UserId, b: UserId) -> HeraldResult<Vec<StoredMessage>> {
        for user_id in [a, b] {
            if !self.users.user_exists(user_id).await? {
                return Err(HeraldError::IdentityNotFound(user_id));
            }
        }
        self.messages.conversation(a, b).await
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.router.is_online(user_id).await
    }

    pub async fn active_count(&self) -> usize {
        self.router.active_count().await
    }

    pub async fn pull_queued(&self, user_id: UserId) -> Vec<ServerEvent> {
        self.router.pull_queued(user_id).await
    }

    pub async fn stats(&self) -> SupervisorStats {
        self.supervisor.stats().await
    }

    pub async fn shutdown(&self) -> usize {
        self.supervisor.shutdown().await
    }
}

fn new_message_event(message: &StoredMessage) -> ServerEvent {
    ServerEvent::NewMessage {
        message_id: message.id,
        content: message.content.clone(),
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        created_at: message.created_at,
    }
}
