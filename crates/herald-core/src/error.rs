use crate::ids::{MessageId, SessionId, UserId};
use thiserror::Error;

/// Errors produced by the herald relay.
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("user not found: {0}")]
    IdentityNotFound(UserId),

    #[error("authentication timeout")]
    AuthTimeout,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session already authenticated as user {0}")]
    AlreadyAuthenticated(UserId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("user {0} is already bound to another session")]
    DuplicateSession(UserId),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection limit ({0}) reached")]
    CapacityExceeded(usize),

    #[error("rate limited: too many authentication attempts")]
    RateLimited,

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeraldError {
    /// Stable reason code reported to clients in `error` and `ack` events.
    pub fn code(&self) -> &'static str {
        match self {
            HeraldError::IdentityNotFound(_) => "identity_not_found",
            HeraldError::AuthTimeout => "auth_timeout",
            HeraldError::NotAuthenticated => "not_authenticated",
            HeraldError::AlreadyAuthenticated(_) => "already_authenticated",
            HeraldError::SessionNotFound(_) => "session_not_found",
            HeraldError::DuplicateSession(_) => "duplicate_session",
            HeraldError::MessageNotFound(_) => "message_not_found",
            HeraldError::NotAuthorized(_) => "not_authorized",
            HeraldError::InvalidMessage(_) => "invalid_message",
            HeraldError::Codec(_) => "codec_error",
            HeraldError::Transport(_) => "transport_failure",
            HeraldError::CapacityExceeded(_) => "capacity_exceeded",
            HeraldError::RateLimited => "rate_limited",
            HeraldError::Store(_) => "store_error",
            HeraldError::Config(_) => "config_error",
            HeraldError::Io(_) => "io_error",
        }
    }
}

impl From<serde_json::Error> for HeraldError {
    fn from(e: serde_json::Error) -> Self {
        HeraldError::Codec(e.to_string())
    }
}

pub type HeraldResult<T> = Result<T, HeraldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case() {
        assert_eq!(HeraldError::IdentityNotFound(UserId(7)).code(), "identity_not_found");
        assert_eq!(HeraldError::AuthTimeout.code(), "auth_timeout");
        assert_eq!(
            HeraldError::NotAuthorized("someone else's message".into()).code(),
            "not_authorized"
        );
    }

    #[test]
    fn display_includes_subject() {
        let err = HeraldError::MessageNotFound(MessageId(42));
        assert_eq!(err.to_string(), "message not found: 42");
    }
}
