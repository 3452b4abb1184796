//! Shared presence state: live sessions, who is online, and who has mail waiting.
//!
//! All three tables sit behind one mutex. Every mutation is a short in-memory
//! critical section with no I/O; sends into a session's outbox never block.

pub mod queue;
pub mod registry;

pub use queue::OfflineQueue;
pub use registry::PresenceRegistry;

use crate::session::ConnectionSession;
use herald_core::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Handle to the presence state shared by the supervisor and the router.
pub type SharedPresence = Arc<Mutex<PresenceState>>;

#[derive(Debug)]
pub struct PresenceState {
    /// Every accepted, not yet destroyed session.
    pub(crate) sessions: HashMap<SessionId, ConnectionSession>,
    pub(crate) registry: PresenceRegistry,
    pub(crate) queue: OfflineQueue,
}

impl PresenceState {
    pub fn new(queue_cap: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            registry: PresenceRegistry::new(),
            queue: OfflineQueue::new(queue_cap),
        }
    }

    pub fn shared(queue_cap: Option<usize>) -> SharedPresence {
        Arc::new(Mutex::new(Self::new(queue_cap)))
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
