//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Encoding errors
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The frame could not be parsed into a known message shape.
    #[error("invalid message format: {0}")]
    Malformed(String),

    /// The frame parsed, but its `type` tag names no known message.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

impl ProtocolError {
    /// The wire error code a gateway should report for this error.
    pub fn code(&self) -> crate::messages::ErrorCode {
        use crate::messages::ErrorCode;
        match self {
            ProtocolError::Serialization(_) => ErrorCode::Internal,
            ProtocolError::Malformed(_) => ErrorCode::Malformed,
            ProtocolError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Malformed(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;

    #[test]
    fn test_malformed_error_display() {
        let err = ProtocolError::Malformed("expected value at line 1".to_string());
        assert_eq!(
            err.to_string(),
            "invalid message format: expected value at line 1"
        );
    }

    #[test]
    fn test_unknown_type_error_display() {
        let err = ProtocolError::UnknownMessageType("launch".to_string());
        assert_eq!(err.to_string(), "unknown message type: launch");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ProtocolError::Malformed(String::new()).code(),
            ErrorCode::Malformed
        );
        assert_eq!(
            ProtocolError::UnknownMessageType(String::new()).code(),
            ErrorCode::UnknownMessageType
        );
        assert_eq!(
            ProtocolError::Serialization(String::new()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
