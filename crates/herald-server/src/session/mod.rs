//! Session lifecycle: connection handles, the auth gate, and the supervisor
//! that creates and destroys sessions.

pub mod auth_gate;
pub mod handle;
pub mod supervisor;

pub use auth_gate::{AuthGate, AuthState};
pub use handle::{ConnectionHandle, Outbox, Outgoing};
pub use supervisor::{AuthGrant, SessionSupervisor, SupervisorStats};

use herald_core::{SessionId, UserId};
use std::net::SocketAddr;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// One accepted connection, tracked from accept until it is destroyed.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Unique per physical connection.
    pub id: SessionId,
    pub auth: AuthState,
    /// Accept time; the auth window is measured from here.
    pub connected_at: Instant,
    pub remote: Option<SocketAddr>,
    pub handle: ConnectionHandle,
    /// Pending auth-timeout action, while unauthenticated.
    pub(crate) timer: Option<AbortHandle>,
}

impl ConnectionSession {
    pub fn user_id(&self) -> Option<UserId> {
        match self.auth {
            AuthState::Authenticated(user_id) => Some(user_id),
            AuthState::Unauthenticated => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }
}
