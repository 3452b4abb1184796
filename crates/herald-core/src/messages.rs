//! Requests a client sends over its channel and the events the relay pushes back.
//!
//! Both directions are JSON objects tagged by `"type"`. The relay only looks at
//! the routing fields of an event (kind, sender, receiver); message content is
//! opaque to it.

use crate::ids::{MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request received from a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Identity claim; must arrive within the auth window.
    Authenticate { user_id: UserId },
    /// Send a chat message from the authenticated user.
    Message { receiver_id: UserId, content: String },
    /// Mark a message addressed to the authenticated user as read.
    MarkRead { message_id: MessageId },
    /// Tell `receiver_id` that the authenticated user is typing.
    Typing { receiver_id: UserId },
}

impl ClientRequest {
    /// Request name used in `ack` events and logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Authenticate { .. } => "authenticate",
            ClientRequest::Message { .. } => "message",
            ClientRequest::MarkRead { .. } => "mark_read",
            ClientRequest::Typing { .. } => "typing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Error,
}

/// An event pushed to a client. This is the payload the router moves around
/// and the offline queue stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
        username: String,
        status: AckStatus,
    },
    NewMessage {
        message_id: MessageId,
        content: String,
        sender_id: UserId,
        receiver_id: UserId,
        created_at: DateTime<Utc>,
    },
    MessageSent {
        message_id: MessageId,
        receiver_id: UserId,
        delivered: bool,
        created_at: DateTime<Utc>,
    },
    MessageRead {
        message_id: MessageId,
        reader_id: UserId,
        timestamp: DateTime<Utc>,
    },
    Typing {
        user_id: UserId,
        receiver_id: UserId,
    },
    UserDisconnected {
        user_id: UserId,
    },
    Ack {
        request: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Coarse classification of an event, used for routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    NewMessage,
    ReadReceipt,
    Typing,
    System,
}

impl ServerEvent {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ServerEvent::NewMessage { .. } => PayloadKind::NewMessage,
            ServerEvent::MessageRead { .. } => PayloadKind::ReadReceipt,
            ServerEvent::Typing { .. } => PayloadKind::Typing,
            _ => PayloadKind::System,
        }
    }

    /// The user whose action produced this event, if any.
    pub fn sender(&self) -> Option<UserId> {
        match self {
            ServerEvent::NewMessage { sender_id, .. } => Some(*sender_id),
            ServerEvent::MessageRead { reader_id, .. } => Some(*reader_id),
            ServerEvent::Typing { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    /// The user this event is addressed to, if it names one.
    pub fn receiver(&self) -> Option<UserId> {
        match self {
            ServerEvent::NewMessage { receiver_id, .. } => Some(*receiver_id),
            ServerEvent::Typing { receiver_id, .. } => Some(*receiver_id),
            _ => None,
        }
    }

    /// Build an `error` event from a relay error.
    pub fn error(err: &crate::HeraldError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn ack_ok(request: &str, message: Option<&str>) -> Self {
        ServerEvent::Ack {
            request: request.to_string(),
            status: AckStatus::Success,
            message: message.map(str::to_string),
        }
    }

    pub fn ack_err(request: &str, err: &crate::HeraldError) -> Self {
        ServerEvent::Ack {
            request: request.to_string(),
            status: AckStatus::Error,
            message: Some(err.code().to_string()),
        }
    }
}

impl PayloadKind {
    /// Transient payloads are meaningless once stale and are never queued.
    pub fn is_transient(self) -> bool {
        matches!(self, PayloadKind::Typing)
    }
}

/// Why a session's channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    TransportFailure,
    AuthTimeout,
    Superseded,
    ServerShutdown,
    /// Refused at accept time because the connection limit was reached.
    Overloaded,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::Superseded => "superseded",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::Overloaded => "overloaded",
        }
    }

    /// WebSocket close code sent with this reason.
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::AuthTimeout => 1008,
            CloseReason::ServerShutdown | CloseReason::Superseded => 1001,
            CloseReason::TransportFailure => 1011,
            CloseReason::ClientClosed => 1000,
            CloseReason::Overloaded => 1013,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_authenticate_request() {
        let req: ClientRequest =
            serde_json::from_value(json!({"type": "authenticate", "user_id": 3})).unwrap();
        assert_eq!(req, ClientRequest::Authenticate { user_id: UserId(3) });
        assert_eq!(req.name(), "authenticate");
    }

    #[test]
    fn parse_message_request() {
        let req: ClientRequest = serde_json::from_value(json!({
            "type": "message",
            "receiver_id": 9,
            "content": "hi"
        }))
        .unwrap();
        assert_eq!(
            req,
            ClientRequest::Message {
                receiver_id: UserId(9),
                content: "hi".into()
            }
        );
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let res: Result<ClientRequest, _> =
            serde_json::from_value(json!({"type": "subscribe", "room": "x"}));
        assert!(res.is_err());
    }

    #[test]
    fn user_disconnected_wire_shape() {
        let ev = ServerEvent::UserDisconnected { user_id: UserId(5) };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "user_disconnected", "user_id": 5})
        );
    }

    #[test]
    fn ack_omits_empty_message() {
        let ev = ServerEvent::ack_ok("typing", None);
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "ack", "request": "typing", "status": "success"})
        );
    }

    #[test]
    fn routing_fields() {
        let ev = ServerEvent::Typing {
            user_id: UserId(1),
            receiver_id: UserId(2),
        };
        assert_eq!(ev.kind(), PayloadKind::Typing);
        assert!(ev.kind().is_transient());
        assert_eq!(ev.sender(), Some(UserId(1)));
        assert_eq!(ev.receiver(), Some(UserId(2)));

        let receipt = ServerEvent::MessageRead {
            message_id: MessageId(4),
            reader_id: UserId(2),
            timestamp: Utc::now(),
        };
        assert_eq!(receipt.kind(), PayloadKind::ReadReceipt);
        assert!(!receipt.kind().is_transient());
    }

    #[test]
    fn auth_timeout_is_policy_violation() {
        assert_eq!(CloseReason::AuthTimeout.close_code(), 1008);
        assert_eq!(CloseReason::Superseded.to_string(), "superseded");
    }

    #[test]
    fn refusal_is_distinct_from_shutdown() {
        assert_eq!(CloseReason::Overloaded.close_code(), 1013);
        assert_ne!(
            CloseReason::Overloaded.close_code(),
            CloseReason::ServerShutdown.close_code()
        );
        assert_eq!(CloseReason::Overloaded.as_str(), "overloaded");
    }
}
