//! Collaborator interfaces for user lookup and message persistence, plus an
//! in-memory implementation of both.
//!
//! The relay never owns durable state; everything here is reached through
//! the `UserDirectory` and `MessageStore` traits so a real datastore can be
//! plugged in. `MemoryStore` models the `users` and `messages` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{HeraldError, HeraldResult, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// A row of the `users` table, minus the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// A row of the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// User existence and display-name lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: UserId) -> HeraldResult<bool>;

    async fn username_for(&self, user_id: UserId) -> HeraldResult<Option<String>>;
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a new message and assign its id and creation time.
    async fn persist_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> HeraldResult<StoredMessage>;

    async fn find_message(&self, message_id: MessageId) -> HeraldResult<Option<StoredMessage>>;

    /// Set `is_read`. Returns `false` if the message was already read.
    async fn set_message_read(&self, message_id: MessageId) -> HeraldResult<bool>;

    /// Messages exchanged between two users, oldest first.
    async fn conversation(&self, a: UserId, b: UserId) -> HeraldResult<Vec<StoredMessage>>;
}

/// Process-local store backing both collaborator traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, UserRecord>>,
    messages: RwLock<BTreeMap<MessageId, StoredMessage>>,
}

impl MemoryStore {
    /// Create a store pre-populated with users.
    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let users = users.into_iter().map(|u| (u.id, u)).collect();
        Self {
            users: RwLock::new(users),
            messages: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user_exists(&self, user_id: UserId) -> HeraldResult<bool> {
        Ok(self.users.read().await.contains_key(&user_id))
    }

    async fn username_for(&self, user_id: UserId) -> HeraldResult<Option<String>> {
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .map(|u| u.username.clone()))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> HeraldResult<StoredMessage> {
        {
            let users = self.users.read().await;
            for id in [sender_id, receiver_id] {
                if !users.contains_key(&id) {
                    return Err(HeraldError::Store(format!(
                        "foreign key violation: user {id} does not exist"
                    )));
                }
            }
        }

        let mut messages = self.messages.write().await;
        let id = MessageId(messages.keys().next_back().map_or(1, |last| last.0 + 1));
        let message = StoredMessage {
            id,
            content: content.to_string(),
            sender_id,
            receiver_id,
            created_at: Utc::now(),
            is_read: false,
        };
        messages.insert(id, message.clone());
        debug!(message_id = %id, sender = %sender_id, receiver = %receiver_id, "message persisted");
        Ok(message)
    }

    async fn find_message(&self, message_id: MessageId) -> HeraldResult<Option<StoredMessage>> {
        Ok(self.messages.read().await.get(&message_id).cloned())
    }

    async fn set_message_read(&self, message_id: MessageId) -> HeraldResult<bool> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&message_id)
            .ok_or(HeraldError::MessageNotFound(message_id))?;
        if message.is_read {
            return Ok(false);
        }
        message.is_read = true;
        Ok(true)
    }

    async fn conversation(&self, a: UserId, b: UserId) -> HeraldResult<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        let mut out: Vec<StoredMessage> = messages
            .values()
            .filter(|m| {
                (m.sender_id == a && m.receiver_id == b) || (m.sender_id == b && m.receiver_id == a)
            })
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.created_at, m.id));
        Ok(out)
    }
}
