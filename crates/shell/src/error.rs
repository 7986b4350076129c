//! Error types for the shell crate.
//!
//! Fatality is decided by the variant, never by inspecting messages. A
//! remote `Failure` or `Reject` is not an error at all; it comes back as a
//! [`protocol::messages::CommandOutcome`] value.

use std::path::PathBuf;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A local filesystem problem. Nothing was sent, or the attempt stopped
    /// before any file bytes moved.
    #[error("{}: {}", .path.display(), .source)]
    LocalIo {
        /// The local path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The streaming phase of an upload or download failed. The session is
    /// still usable.
    #[error("{0}")]
    Transfer(String),

    /// A message failed channel-level verification. The session has been
    /// closed.
    #[error("{0}")]
    Verification(String),

    /// The transport underneath the session is gone. The session has been
    /// closed.
    #[error("{0}")]
    ConnectionLost(String),

    /// The session was already closed when the operation started.
    #[error("session is closed")]
    SessionClosed,
}

impl ShellError {
    /// Creates a [`ShellError::LocalIo`].
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ShellError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the session cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::Verification(_) | ShellError::ConnectionLost(_) | ShellError::SessionClosed
        )
    }

    /// The prefix shown to the user in front of the message.
    pub fn category(&self) -> &'static str {
        match self {
            ShellError::LocalIo { .. } => "Local error",
            ShellError::Transfer(_) => "Transfer error",
            ShellError::Verification(_) => "Protocol error",
            ShellError::ConnectionLost(_) | ShellError::SessionClosed => "Connection error",
        }
    }
}

impl From<ProtocolError> for ShellError {
    fn from(err: ProtocolError) -> Self {
        if err.is_integrity_failure() {
            ShellError::Verification(err.to_string())
        } else {
            ShellError::ConnectionLost(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!ShellError::local_io("a.txt", std::io::ErrorKind::NotFound.into()).is_fatal());
        assert!(!ShellError::Transfer("short read".into()).is_fatal());
        assert!(ShellError::Verification("bad tag".into()).is_fatal());
        assert!(ShellError::ConnectionLost("eof".into()).is_fatal());
        assert!(ShellError::SessionClosed.is_fatal());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ShellError::local_io("a.txt", std::io::ErrorKind::NotFound.into()).category(),
            "Local error"
        );
        assert_eq!(ShellError::Transfer(String::new()).category(), "Transfer error");
        assert_eq!(ShellError::Verification(String::new()).category(), "Protocol error");
        assert_eq!(ShellError::SessionClosed.category(), "Connection error");
    }

    #[test]
    fn test_local_io_display_names_path() {
        let err = ShellError::local_io(
            "missing.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        assert_eq!(err.to_string(), "missing.txt: not found");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: ShellError = ProtocolError::SequenceMismatch { expected: 3, got: 5 }.into();
        assert!(matches!(err, ShellError::Verification(_)));

        let err: ShellError = ProtocolError::Decryption("tag".into()).into();
        assert!(matches!(err, ShellError::Verification(_)));

        let err: ShellError = ProtocolError::ConnectionClosed("eof".into()).into();
        assert!(matches!(err, ShellError::ConnectionLost(_)));
    }
}
