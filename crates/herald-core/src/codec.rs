//! JSON text framing for the herald channel.
//!
//! One WebSocket text frame carries exactly one JSON object.

use crate::error::{HeraldError, HeraldResult};
use crate::messages::{ClientRequest, ServerEvent};

/// Maximum accepted size of an inbound frame (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode a server event into the text of one frame.
pub fn encode_event(event: &ServerEvent) -> HeraldResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode one inbound frame into a client request.
pub fn decode_request(text: &str) -> HeraldResult<ClientRequest> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(HeraldError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }
    serde_json::from_str(text).map_err(|e| HeraldError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, UserId};

    #[test]
    fn decode_mark_read() {
        let req = decode_request(r#"{"type":"mark_read","message_id":17}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::MarkRead {
                message_id: MessageId(17)
            }
        );
    }

    #[test]
    fn malformed_json_is_invalid_message() {
        let err = decode_request("{not json").unwrap_err();
        assert_eq!(err.code(), "invalid_message");
    }

    #[test]
    fn oversized_frame_rejected() {
        let content = "x".repeat(MAX_FRAME_SIZE);
        let text = format!(r#"{{"type":"message","receiver_id":1,"content":"{content}"}}"#);
        let err = decode_request(&text).unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[test]
    fn encode_typing() {
        let text = encode_event(&ServerEvent::Typing {
            user_id: UserId(1),
            receiver_id: UserId(2),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"typing","user_id":1,"receiver_id":2}"#);
    }
}
