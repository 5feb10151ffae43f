//! Error taxonomy for the chat transport.
//!
//! Per-frame codec failures ([`CodecError`]) never tear down a connection;
//! they are reported to the caller and the offending frame is dropped.
//! Connection-level failures surface as [`ChatError`].

use thiserror::Error;

use crate::protocol::EnvelopeType;

/// Encode/decode failures for a single wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The outbound envelope cannot be put on the wire.
    #[error("Encode error: {0}")]
    Encode(String),

    /// The frame is not a JSON object.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// `type` is absent (`None`) or not one of the known envelope types.
    #[error("Unknown envelope type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownType(Option<String>),

    /// The envelope or its payload does not have the shape `kind` requires.
    #[error("Invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: EnvelopeType, reason: String },
}

/// Connection-level and session-level errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The base API URL is missing or unusable. No connection is attempted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `send` was called while the connection is not OPEN.
    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The conversation is not held in the local store.
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_display() {
        let missing = CodecError::UnknownType(None);
        assert_eq!(missing.to_string(), "Unknown envelope type: <missing>");

        let bogus = CodecError::UnknownType(Some("sticker".into()));
        assert_eq!(bogus.to_string(), "Unknown envelope type: sticker");
    }

    #[test]
    fn test_invalid_payload_display() {
        let err = CodecError::InvalidPayload {
            kind: EnvelopeType::ReadReceipt,
            reason: "message_ids is empty".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid payload for 'read_receipt': message_ids is empty"
        );
    }

    #[test]
    fn test_codec_error_converts_into_chat_error() {
        let err: ChatError = CodecError::MalformedFrame("eof".into()).into();
        assert!(matches!(err, ChatError::Codec(CodecError::MalformedFrame(_))));
        assert_eq!(err.to_string(), "Malformed frame: eof");
    }
}
