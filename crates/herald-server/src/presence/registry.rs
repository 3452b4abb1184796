//! Presence registry: which user is online, and through which session.
//!
//! Holds the `UserId -> handle` map and its `SessionId -> UserId` inverse.
//! Both maps change together inside every call, so they never disagree.
//! The registry does not evict: binding a user that is still bound to a
//! different session is refused, and the caller must unbind first.

use crate::session::ConnectionHandle;
use herald_core::{HeraldError, HeraldResult, SessionId, UserId};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_user: HashMap<UserId, ConnectionHandle>,
    by_session: HashMap<SessionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to the session behind `handle`.
    ///
    /// Rebinding the same pair is a no-op. Fails with `DuplicateSession` if the
    /// user is bound elsewhere and with `AlreadyAuthenticated` if the session
    /// already belongs to another user.
    pub fn bind(&mut self, user_id: UserId, handle: ConnectionHandle) -> HeraldResult<()> {
        if let Some(existing) = self.by_user.get(&user_id) {
            if existing.session_id() == handle.session_id() {
                return Ok(());
            }
            return Err(HeraldError::DuplicateSession(user_id));
        }
        if let Some(owner) = self.by_session.get(handle.session_id()) {
            return Err(HeraldError::AlreadyAuthenticated(*owner));
        }

        debug!(user_id = %user_id, session_id = %handle.session_id().short(), "presence bound");
        self.by_session.insert(handle.session_id().clone(), user_id);
        self.by_user.insert(user_id, handle);
        Ok(())
    }

    /// Remove a user's binding. Unbinding an absent user is a no-op.
    pub fn unbind(&mut self, user_id: UserId) -> Option<ConnectionHandle> {
        let handle = self.by_user.remove(&user_id)?;
        self.by_session.remove(handle.session_id());
        debug!(user_id = %user_id, "presence unbound");
        Some(handle)
    }

    /// Remove whatever binding `session_id` holds. Returns the user it was bound to.
    pub fn unbind_by_session(&mut self, session_id: &SessionId) -> Option<UserId> {
        let user_id = self.by_session.remove(session_id)?;
        self.by_user.remove(&user_id);
        debug!(user_id = %user_id, session_id = %session_id.short(), "presence unbound");
        Some(user_id)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user.contains_key(&user_id)
    }

    pub fn lookup(&self, user_id: UserId) -> Option<&ConnectionHandle> {
        self.by_user.get(&user_id)
    }

    pub fn user_for_session(&self, session_id: &SessionId) -> Option<UserId> {
        self.by_session.get(session_id).copied()
    }

    /// Number of bound users.
    pub fn count(&self) -> usize {
        self.by_user.len()
    }

    /// Snapshot of every bound handle.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.by_user.values().cloned().collect()
    }
}
