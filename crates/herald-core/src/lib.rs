//! herald-core: Shared protocol library for the herald messaging relay.
//!
//! Provides the identifier types, the JSON request/event vocabulary spoken over
//! the WebSocket channel, the frame codec, and the error taxonomy.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_request, encode_event, MAX_FRAME_SIZE};
pub use error::{HeraldError, HeraldResult};
pub use ids::{MessageId, SessionId, UserId};
pub use messages::{AckStatus, ClientRequest, CloseReason, PayloadKind, ServerEvent};
