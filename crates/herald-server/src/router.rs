//! Delivery router: live send when the recipient is online, offline queue
//! otherwise.
//!
//! A send that fails on a "live" handle is treated as that session dropping:
//! the session is evicted through the supervisor's cleanup path and the
//! payload falls back to the queue. Callers never see the failure.

use crate::presence::{PresenceState, SharedPresence};
use chrono::Utc;
use herald_core::{CloseReason, MessageId, ServerEvent, UserId};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// What happened to a routed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the recipient's live session.
    Delivered,
    /// Recipient offline; payload is waiting in the offline queue.
    Queued,
    /// Recipient offline and the payload is transient.
    Dropped,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

#[derive(Clone)]
pub struct DeliveryRouter {
    state: SharedPresence,
}

impl DeliveryRouter {
    pub fn new(state: SharedPresence) -> Self {
        Self { state }
    }

    /// Route a payload to one user.
    pub async fn send_to_user(&self, user_id: UserId, payload: ServerEvent) -> Delivery {
        self.state.lock().await.route(user_id, payload)
    }

    /// Send to every bound session. Returns how many sends succeeded; failing
    /// sessions are evicted without affecting the rest.
    pub async fn broadcast(&self, payload: ServerEvent) -> usize {
        self.state.lock().await.broadcast_locked(payload)
    }

    /// Tell the sender of `message_id` that `reader_id` read it. Best effort.
    pub async fn send_read_receipt(
        &self,
        sender_id: UserId,
        message_id: MessageId,
        reader_id: UserId,
    ) -> Delivery {
        let receipt = ServerEvent::MessageRead {
            message_id,
            reader_id,
            timestamp: Utc::now(),
        };
        let outcome = self.send_to_user(sender_id, receipt).await;
        debug!(message_id = %message_id, sender = %sender_id, outcome = ?outcome, "read receipt routed");
        outcome
    }

    /// Tell `receiver_id` that `sender_id` is typing. Best effort.
    pub async fn send_typing(&self, sender_id: UserId, receiver_id: UserId) -> Delivery {
        let indicator = ServerEvent::Typing {
            user_id: sender_id,
            receiver_id,
        };
        let outcome = self.send_to_user(receiver_id, indicator).await;
        debug!(sender = %sender_id, receiver = %receiver_id, outcome = ?outcome, "typing indicator routed");
        outcome
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.lock().await.registry.is_online(user_id)
    }

    /// Number of users currently online.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.registry.count()
    }

    /// Explicit pull: hand over and clear whatever is queued for the user.
    pub async fn pull_queued(&self, user_id: UserId) -> Vec<ServerEvent> {
        let pulled = self.state.lock().await.queue.drain(user_id);
        if !pulled.is_empty() {
            debug!(user_id = %user_id, count = pulled.len(), "queued payloads pulled");
        }
        pulled
    }

    pub async fn queued_len(&self, user_id: UserId) -> usize {
        self.state.lock().await.queue.len(user_id)
    }

    pub async fn queued_total(&self) -> usize {
        self.state.lock().await.queue.total()
    }
}

impl PresenceState {
    pub(crate) fn route(&mut self, user_id: UserId, payload: ServerEvent) -> Delivery {
        if let Some(handle) = self.registry.lookup(user_id).cloned() {
            match handle.send(payload.clone()) {
                Ok(()) => return Delivery::Delivered,
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        session_id = %handle.session_id().short(),
                        error = %e,
                        "live send failed, evicting session"
                    );
                    self.disconnect_session(handle.session_id(), CloseReason::TransportFailure);
                }
            }
        }

        if payload.kind().is_transient() {
            debug!(user_id = %user_id, kind = ?payload.kind(), "recipient offline, transient payload dropped");
            return Delivery::Dropped;
        }
        self.queue.enqueue(user_id, payload);
        Delivery::Queued
    }

    /// Fan a payload out to every bound session. Sessions that fail are
    /// destroyed and their departure is announced in turn, until no send fails.
    pub(crate) fn broadcast_locked(&mut self, payload: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut rounds = VecDeque::from([payload]);
        let mut first_round = true;

        while let Some(event) = rounds.pop_front() {
            let mut failed = Vec::new();
            for handle in self.registry.handles() {
                match handle.send(event.clone()) {
                    Ok(()) if first_round => delivered += 1,
                    Ok(()) => {}
                    Err(e) => {
                        warn!(session_id = %handle.session_id().short(), error = %e, "broadcast send failed");
                        failed.push(handle.session_id().clone());
                    }
                }
            }
            first_round = false;

            for session_id in failed {
                let departed = self
                    .destroy_session(&session_id, CloseReason::TransportFailure)
                    .and_then(|s| s.user_id());
                if let Some(user_id) = departed {
                    rounds.push_back(ServerEvent::UserDisconnected { user_id });
                }
            }
        }
        delivered
    }
}
