//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed (authentication tag did not verify).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed static key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Envelope errors
    /// Envelope carried an unsupported protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u8,
        /// Version found in the envelope.
        got: u8,
    },

    /// Envelope sequence number was not the next expected one (gap or replay).
    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch {
        /// The next sequence number the receiver expected.
        expected: u64,
        /// The sequence number actually received.
        got: u64,
    },

    /// A well-formed message arrived where a different kind was required.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// Kind of message the protocol step required.
        expected: &'static str,
        /// Kind of message that arrived.
        got: &'static str,
    },

    // Connection errors
    /// Connection was closed, locally or by the peer.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Other transport I/O failure.
    #[error("transport error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Returns true if this error means a received message could not be
    /// trusted: it failed authentication, could not be decoded, was out of
    /// sequence, or was not the message the protocol step called for.
    ///
    /// Transport losses and local encoding problems return false.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decryption(_)
                | ProtocolError::Deserialization(_)
                | ProtocolError::VersionMismatch { .. }
                | ProtocolError::SequenceMismatch { .. }
                | ProtocolError::UnexpectedMessage { .. }
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => ProtocolError::Decryption(err.to_string()),
            snow::Error::Input | snow::Error::Dh | snow::Error::State(_) => {
                ProtocolError::HandshakeFailed(err.to_string())
            }
            _ => ProtocolError::Encryption(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_sequence_mismatch_error_display() {
        let err = ProtocolError::SequenceMismatch { expected: 4, got: 3 };
        assert_eq!(err.to_string(), "sequence mismatch: expected 4, got 3");
    }

    #[test]
    fn test_unexpected_message_error_display() {
        let err = ProtocolError::UnexpectedMessage {
            expected: "CommandResult",
            got: "FileChunk",
        };
        assert_eq!(
            err.to_string(),
            "unexpected message: expected CommandResult, got FileChunk"
        );
    }

    #[test]
    fn test_handshake_incomplete_error_display() {
        let err = ProtocolError::HandshakeIncomplete;
        assert_eq!(
            err.to_string(),
            "handshake incomplete: cannot perform operation before handshake is finished"
        );
    }

    #[test]
    fn test_integrity_failures() {
        assert!(ProtocolError::Decryption("tag".into()).is_integrity_failure());
        assert!(ProtocolError::Deserialization("bad".into()).is_integrity_failure());
        assert!(ProtocolError::SequenceMismatch { expected: 2, got: 9 }.is_integrity_failure());
        assert!(ProtocolError::VersionMismatch { expected: 1, got: 7 }.is_integrity_failure());
    }

    #[test]
    fn test_transport_losses_are_not_integrity_failures() {
        assert!(!ProtocolError::ConnectionClosed("eof".into()).is_integrity_failure());
        assert!(!ProtocolError::Timeout("slow".into()).is_integrity_failure());
        assert!(!ProtocolError::Io("refused".into()).is_integrity_failure());
        assert!(!ProtocolError::Serialization("local".into()).is_integrity_failure());
    }

    #[test]
    fn test_from_snow_decrypt_error() {
        let err: ProtocolError = snow::Error::Decrypt.into();
        assert!(matches!(err, ProtocolError::Decryption(_)));
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
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
