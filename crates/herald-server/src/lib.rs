//! herald-server: presence-aware message relay.
//!
//! Tracks which users hold a live connection, delivers messages to them
//! immediately, and keeps everything else in a per-user offline queue that is
//! flushed, in order, the moment the user authenticates again.

pub mod auth;
pub mod config;
pub mod presence;
pub mod router;
pub mod server;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;

pub use config::ServerConfig;
pub use presence::{PresenceState, SharedPresence};
pub use router::{Delivery, DeliveryRouter};
pub use server::HeraldServer;
pub use service::{ReadOutcome, Relay, RelaySettings, SendReceipt};
pub use session::{AuthGrant, ConnectionHandle, Outbox, Outgoing, SessionSupervisor};
pub use store::{MemoryStore, MessageStore, StoredMessage, UserDirectory, UserRecord};
