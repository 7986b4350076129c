//! Protocol message definitions for FileShell.
//!
//! This module defines every message exchanged between the client and the
//! file server once the Noise session is up. All messages are serialized
//! using MessagePack inside a versioned, sequenced [`Envelope`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length in bytes of every digest carried by the protocol (SHA-256).
pub const DIGEST_LENGTH: usize = 32;

/// Length in bytes of the random nonce in a login request.
pub const LOGIN_NONCE_LENGTH: usize = 16;

/// Envelope wrapper for all protocol messages.
///
/// Sequence numbers start at 1 and increase by one per message in each
/// direction; the receiver rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-direction message sequence number.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Login
    /// Username/password login, first message after the handshake.
    LoginRequest(LoginRequest),
    /// Server's answer to a login request.
    LoginResponse(LoginResponse),

    // Commands
    /// A file-management command.
    Command(CommandRequest),
    /// The single response to a command.
    CommandResult(CommandResponse),

    // Transfers
    /// A piece of file content, in either direction.
    FileChunk(FileChunk),
    /// Server's confirmation of what it stored after an upload.
    UploadReceipt(UploadReceipt),
    /// Client's answer to a download offer.
    DownloadControl(DownloadControl),
}

impl Message {
    /// Short name of the message kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LoginRequest(_) => "LoginRequest",
            Message::LoginResponse(_) => "LoginResponse",
            Message::Command(_) => "Command",
            Message::CommandResult(_) => "CommandResult",
            Message::FileChunk(_) => "FileChunk",
            Message::UploadReceipt(_) => "UploadReceipt",
            Message::DownloadControl(_) => "DownloadControl",
        }
    }
}

// ============================================================================
// Login Messages
// ============================================================================

/// Username/password login request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Fresh random bytes so that no two login requests encode identically.
    #[serde(with = "serde_bytes")]
    pub client_nonce: Vec<u8>,
    /// Client clock at send time (Unix epoch milliseconds).
    pub timestamp: u64,
}

impl LoginRequest {
    /// Create a login request with a fresh nonce and the current time.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            username: username.into(),
            password: password.into(),
            client_nonce: rand::random::<[u8; LOGIN_NONCE_LENGTH]>().to_vec(),
            timestamp,
        }
    }

    /// SHA-256 over the MessagePack encoding of this request.
    pub fn fingerprint(&self) -> Result<[u8; DIGEST_LENGTH], rmp_serde::encode::Error> {
        fingerprint_of(self)
    }
}

/// Server's answer to a login request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// SHA-256 of the login request being answered.
    #[serde(with = "serde_bytes")]
    pub request_digest: Vec<u8>,
    /// Whether the credentials were accepted.
    pub accepted: bool,
    /// Reason for refusal, if any.
    pub reason: Option<String>,
}

// ============================================================================
// Command Messages
// ============================================================================

/// The command being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Print the remote working directory.
    Pwd,
    /// List the remote working directory.
    List,
    /// Change the remote working directory.
    Chdir,
    /// Create a remote directory.
    Mkdir,
    /// Delete a remote file or empty directory.
    Delete,
    /// Announce an upload.
    Upload,
    /// Ask for a download offer.
    Download,
}

/// A file-management command.
///
/// `argument` holds the directory or file name, `size` and `digest` are only
/// present for uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Which command.
    pub command: CommandKind,
    /// Directory or file name argument.
    pub argument: Option<String>,
    /// File size in bytes (upload).
    pub size: Option<u64>,
    /// SHA-256 of the file content (upload).
    #[serde(with = "serde_bytes")]
    pub digest: Option<Vec<u8>>,
}

impl CommandRequest {
    fn bare(command: CommandKind) -> Self {
        Self {
            command,
            argument: None,
            size: None,
            digest: None,
        }
    }

    fn with_argument(command: CommandKind, argument: impl Into<String>) -> Self {
        Self {
            argument: Some(argument.into()),
            ..Self::bare(command)
        }
    }

    /// `pwd`
    pub fn pwd() -> Self {
        Self::bare(CommandKind::Pwd)
    }

    /// `ls`
    pub fn list() -> Self {
        Self::bare(CommandKind::List)
    }

    /// `cd <dir>`
    pub fn chdir(dir: impl Into<String>) -> Self {
        Self::with_argument(CommandKind::Chdir, dir)
    }

    /// `mkd <dir>`
    pub fn mkdir(dir: impl Into<String>) -> Self {
        Self::with_argument(CommandKind::Mkdir, dir)
    }

    /// `del <name>`
    pub fn delete(name: impl Into<String>) -> Self {
        Self::with_argument(CommandKind::Delete, name)
    }

    /// Announce an upload of `name` with the given size and digest.
    pub fn upload(name: impl Into<String>, size: u64, digest: [u8; DIGEST_LENGTH]) -> Self {
        Self {
            size: Some(size),
            digest: Some(digest.to_vec()),
            ..Self::with_argument(CommandKind::Upload, name)
        }
    }

    /// Ask the server to offer `name` for download.
    pub fn download(name: impl Into<String>) -> Self {
        Self::with_argument(CommandKind::Download, name)
    }

    /// SHA-256 over the MessagePack encoding of this request.
    ///
    /// The server echoes this value in its response so the client can tie
    /// each response to the request it answers.
    pub fn fingerprint(&self) -> Result<[u8; DIGEST_LENGTH], rmp_serde::encode::Error> {
        fingerprint_of(self)
    }
}

/// First result field of a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// The command was carried out.
    Success,
    /// The command was attempted and failed.
    Failure,
    /// The server declined to attempt the command.
    Reject,
}

/// Response to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// SHA-256 of the request being answered.
    #[serde(with = "serde_bytes")]
    pub request_digest: Vec<u8>,
    /// What happened.
    pub outcome: CommandOutcome,
    /// Text result: listing, working directory or error message.
    pub detail: Option<String>,
    /// File size (download offer).
    pub size: Option<u64>,
    /// File digest (download offer).
    #[serde(with = "serde_bytes")]
    pub digest: Option<Vec<u8>>,
}

impl CommandResponse {
    /// A response with only an outcome and optional detail text.
    pub fn new(
        request_digest: [u8; DIGEST_LENGTH],
        outcome: CommandOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            request_digest: request_digest.to_vec(),
            outcome,
            detail,
            size: None,
            digest: None,
        }
    }

    /// A successful download offer for a file of `size` bytes.
    pub fn download_offer(
        request_digest: [u8; DIGEST_LENGTH],
        size: u64,
        digest: [u8; DIGEST_LENGTH],
    ) -> Self {
        Self {
            size: Some(size),
            digest: Some(digest.to_vec()),
            ..Self::new(request_digest, CommandOutcome::Success, None)
        }
    }
}

// ============================================================================
// Transfer Messages
// ============================================================================

/// A piece of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// The chunk data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Whether this is the final chunk of the file.
    pub last: bool,
}

/// What the server stored after an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Number of bytes stored.
    pub size: u64,
    /// SHA-256 of the bytes stored.
    #[serde(with = "serde_bytes")]
    pub digest: Vec<u8>,
}

/// Client's answer to a download offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadControl {
    /// Start sending the file.
    Ready,
    /// Drop the offer and release the server-side state.
    Cancel,
}

// ============================================================================
// Serialization helpers
// ============================================================================

fn fingerprint_of<T: Serialize>(value: &T) -> Result<[u8; DIGEST_LENGTH], rmp_serde::encode::Error> {
    let bytes = rmp_serde::to_vec(value)?;
    let hash = Sha256::digest(&bytes);
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&hash);
    Ok(digest)
}
