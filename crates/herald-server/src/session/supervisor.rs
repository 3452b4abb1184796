//! Session supervisor: the only place sessions are created or destroyed.
//!
//! Accepts connections, arms the auth gate, admits authenticated sessions into
//! the presence registry (evicting a superseded login first), flushes the
//! offline queue, and runs the same cleanup path for every way a session can
//! end: client close, transport failure, auth timeout, supersede, shutdown.

use super::auth_gate::{AuthGate, AuthState};
use super::handle::{self, ConnectionHandle, Outbox};
use super::ConnectionSession;
use crate::presence::{PresenceState, SharedPresence};
use crate::store::UserDirectory;
use herald_core::{CloseReason, HeraldError, HeraldResult, ServerEvent, SessionId, UserId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of a successful identity claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub user_id: UserId,
    pub username: String,
    /// Older session of the same user that was evicted to make room.
    pub superseded: Option<SessionId>,
    /// Queued payloads delivered right after binding.
    pub flushed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub sessions: usize,
    pub online: usize,
    pub queued: usize,
}

#[derive(Clone)]
pub struct SessionSupervisor {
    state: SharedPresence,
    gate: AuthGate,
    users: Arc<dyn UserDirectory>,
    max_connections: usize,
    outbound_limit: usize,
}

impl SessionSupervisor {
    pub fn new(
        state: SharedPresence,
        gate: AuthGate,
        users: Arc<dyn UserDirectory>,
        max_connections: usize,
        outbound_limit: usize,
    ) -> Self {
        Self {
            state,
            gate,
            users,
            max_connections,
            outbound_limit,
        }
    }

    /// Accept a new connection: create an unauthenticated session and start
    /// its auth timer. The returned outbox feeds the transport.
    pub async fn connect(&self, remote: Option<SocketAddr>) -> HeraldResult<(SessionId, Outbox)> {
        let mut state = self.state.lock().await;
        if state.sessions.len() >= self.max_connections {
            warn!(max = self.max_connections, remote = ?remote, "connection refused: limit reached");
            return Err(HeraldError::CapacityExceeded(self.max_connections));
        }

        let mut session_id = SessionId::generate();
        while state.sessions.contains_key(&session_id) {
            session_id = SessionId::generate();
        }
        let (handle, outbox) = handle::channel(session_id.clone(), self.outbound_limit);
        let connected_at = Instant::now();

        let supervisor = self.clone();
        let timer = self
            .gate
            .arm(session_id.clone(), connected_at, move |expired| async move {
                supervisor.expire(&expired).await;
            });

        state.sessions.insert(
            session_id.clone(),
            ConnectionSession {
                id: session_id.clone(),
                auth: AuthState::Unauthenticated,
                connected_at,
                remote,
                handle,
                timer: Some(timer),
            },
        );
        info!(session_id = %session_id.short(), remote = ?remote, "session accepted");
        Ok((session_id, outbox))
    }

    /// Handle an identity claim for `session_id`.
    ///
    /// The user is checked against the directory before any state changes; an
    /// unknown user leaves the session unauthenticated so the client can retry
    /// within its window.
    pub async fn authenticate(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> HeraldResult<AuthGrant> {
        {
            let state = self.state.lock().await;
            let session = state
                .sessions
                .get(session_id)
                .ok_or_else(|| HeraldError::SessionNotFound(session_id.clone()))?;
            session.auth.ensure_unauthenticated()?;
        }

        if !self.users.user_exists(user_id).await? {
            warn!(session_id = %session_id.short(), user_id = %user_id, "authentication failed: unknown user");
            return Err(HeraldError::IdentityNotFound(user_id));
        }
        let username = self
            .users
            .username_for(user_id)
            .await?
            .unwrap_or_else(|| user_id.to_string());

        // The session may have timed out or closed while the directory was consulted.
        let mut state = self.state.lock().await;
        state.admit(session_id, user_id, username)
    }

    /// Auth timeout action. No-op unless the session still exists unauthenticated.
    pub async fn expire(&self, session_id: &SessionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return false;
        };
        if session.is_authenticated() {
            debug!(session_id = %session_id.short(), "auth timer fired after authentication, ignored");
            return false;
        }

        // This task is the timer; nothing left to abort.
        session.timer = None;
        warn!(
            session_id = %session_id.short(),
            elapsed_ms = session.connected_at.elapsed().as_millis() as u64,
            "authentication timeout"
        );
        let _ = session
            .handle
            .send(ServerEvent::error(&HeraldError::AuthTimeout));
        state.disconnect_session(session_id, CloseReason::AuthTimeout)
    }

    /// Cleanup for a session that ended. Safe to call for sessions that are
    /// already gone.
    pub async fn disconnect(&self, session_id: &SessionId, reason: CloseReason) -> bool {
        self.state.lock().await.disconnect_session(session_id, reason)
    }

    /// Send a direct reply to one session, authenticated or not.
    pub async fn reply(&self, session_id: &SessionId, event: ServerEvent) -> HeraldResult<()> {
        let mut state = self.state.lock().await;
        let handle = state
            .sessions
            .get(session_id)
            .map(|s| s.handle.clone())
            .ok_or_else(|| HeraldError::SessionNotFound(session_id.clone()))?;
        if let Err(e) = handle.send(event) {
            warn!(session_id = %session_id.short(), error = %e, "reply failed");
            state.disconnect_session(session_id, CloseReason::TransportFailure);
            return Err(e);
        }
        Ok(())
    }

    /// Close every session. No departure notices are sent.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.lock().await;
        let ids: Vec<SessionId> = state.sessions.keys().cloned().collect();
        for id in &ids {
            state.destroy_session(id, CloseReason::ServerShutdown);
        }
        info!(count = ids.len(), "all sessions closed for shutdown");
        ids.len()
    }

    pub async fn user_of(&self, session_id: &SessionId) -> Option<UserId> {
        let state = self.state.lock().await;
        state.sessions.get(session_id).and_then(|s| s.user_id())
    }

    pub async fn stats(&self) -> SupervisorStats {
        let state = self.state.lock().await;
        SupervisorStats {
            sessions: state.sessions.len(),
            online: state.registry.count(),
            queued: state.queue.total(),
        }
    }
}

impl PresenceState {
    /// Bind an authenticated session and flush the user's backlog, all in one
    /// critical section so no live send can overtake the backlog.
    pub(crate) fn admit(
        &mut self,
        session_id: &SessionId,
        user_id: UserId,
        username: String,
    ) -> HeraldResult<AuthGrant> {
        let handle = {
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| HeraldError::SessionNotFound(session_id.clone()))?;
            session.auth.ensure_unauthenticated()?;
            session.handle.clone()
        };

        // Evict the previous login before binding, never after.
        let superseded = match self.registry.lookup(user_id) {
            Some(existing) if existing.session_id() != session_id => {
                Some(existing.session_id().clone())
            }
            _ => None,
        };
        if let Some(old) = &superseded {
            info!(
                user_id = %user_id,
                old_session = %old.short(),
                new_session = %session_id.short(),
                "superseding existing session"
            );
            self.disconnect_session(old, CloseReason::Superseded);
        }

        self.registry.bind(user_id, handle.clone())?;
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.auth.admit(user_id)?;
            if let Some(timer) = session.timer.take() {
                timer.abort();
            }
        }
        info!(session_id = %session_id.short(), user_id = %user_id, "user authenticated");

        let greeting = ServerEvent::Authenticated {
            user_id,
            username: username.clone(),
            status: herald_core::AckStatus::Success,
        };
        if let Err(e) = handle.send(greeting) {
            warn!(session_id = %session_id.short(), error = %e, "could not confirm authentication");
            self.disconnect_session(session_id, CloseReason::TransportFailure);
            return Err(e);
        }

        let flushed = self.flush_backlog(user_id, &handle)?;
        Ok(AuthGrant {
            user_id,
            username,
            superseded,
            flushed,
        })
    }

    /// Deliver the user's queued payloads in order. On a transport failure the
    /// session is torn down and the undelivered tail goes back to the queue.
    fn flush_backlog(&mut self, user_id: UserId, handle: &ConnectionHandle) -> HeraldResult<usize> {
        let backlog = self.queue.drain(user_id);
        let total = backlog.len();
        let mut remaining = backlog.into_iter();
        let mut flushed = 0;

        while let Some(payload) = remaining.next() {
            if let Err(e) = handle.send_backlog(payload.clone()) {
                warn!(user_id = %user_id, flushed, total, error = %e, "backlog flush failed");
                let mut undelivered = vec![payload];
                undelivered.extend(remaining);
                self.disconnect_session(handle.session_id(), CloseReason::TransportFailure);
                self.queue.requeue_front(user_id, undelivered);
                return Err(e);
            }
            flushed += 1;
        }

        if flushed > 0 {
            info!(user_id = %user_id, flushed, "delivered queued payloads");
        }
        Ok(flushed)
    }

    /// Remove a session: stop its timer, close its channel, drop its binding.
    pub(crate) fn destroy_session(
        &mut self,
        session_id: &SessionId,
        reason: CloseReason,
    ) -> Option<ConnectionSession> {
        let mut session = self.sessions.remove(session_id)?;
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        session.handle.close(reason);
        if session.is_authenticated() {
            self.registry.unbind_by_session(session_id);
        }
        info!(
            session_id = %session_id.short(),
            user_id = ?session.user_id(),
            reason = %reason,
            "session closed"
        );
        Some(session)
    }

    /// Destroy a session and, if it was authenticated, tell everyone else.
    /// Returns `false` if the session was already gone.
    pub(crate) fn disconnect_session(&mut self, session_id: &SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.destroy_session(session_id, reason) else {
            return false;
        };
        if let Some(user_id) = session.user_id() {
            self.broadcast_locked(ServerEvent::UserDisconnected { user_id });
        }
        true
    }
}
