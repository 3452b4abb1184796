//! Auth gate: a session must name its user within a fixed window.
//!
//! States: `Unauthenticated -> Authenticated(user)`. There is no way back;
//! a session that never authenticates is destroyed by the timeout action
//! instead of changing state.

use herald_core::{HeraldError, HeraldResult, SessionId, UserId};
use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default window for the identity claim.
pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated(UserId),
}

impl AuthState {
    /// Accept an identity claim. Only valid from `Unauthenticated`.
    pub fn admit(&mut self, user_id: UserId) -> HeraldResult<()> {
        match *self {
            AuthState::Unauthenticated => {
                *self = AuthState::Authenticated(user_id);
                Ok(())
            }
            AuthState::Authenticated(current) => Err(HeraldError::AlreadyAuthenticated(current)),
        }
    }

    /// Fails if the session already carries an identity.
    pub fn ensure_unauthenticated(&self) -> HeraldResult<()> {
        match *self {
            AuthState::Unauthenticated => Ok(()),
            AuthState::Authenticated(current) => Err(HeraldError::AlreadyAuthenticated(current)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthGate {
    window: Duration,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_WINDOW)
    }
}

impl AuthGate {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn deadline(&self, connected_at: Instant) -> Instant {
        connected_at + self.window
    }

    /// Schedule `on_expire` for the end of the session's window.
    ///
    /// The action must itself check whether the session is still
    /// unauthenticated: aborting the returned handle is best effort and can
    /// lose the race with an already running action.
    pub fn arm<F, Fut>(&self, session_id: SessionId, connected_at: Instant, on_expire: F) -> AbortHandle
    where
        F: FnOnce(SessionId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = self.deadline(connected_at);
        debug!(session_id = %session_id.short(), window_secs = self.window.as_secs(), "auth timer armed");
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expire(session_id).await;
        })
        .abort_handle()
    }
}
