//! # FileShell Protocol Library
//!
//! Wire-level building blocks shared by the FileShell client and any peer
//! that speaks to it.
//!
//! - **Messages**: login, command/response and file-transfer messages
//! - **Keys**: static X25519 keypairs, fingerprints, hex storage
//! - **Noise Protocol**: XX handshake and transport encryption
//! - **Frame Codec**: length-prefixed frames on a byte stream
//! - **Secure Channel**: the message-level channel built from all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Envelope { version, sequence, msg }   │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │           Noise Encryption              │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  "FSH1" + length prefix
//! ├─────────────────────────────────────────┤
//! │              Transport                  │  TCP
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::CommandRequest;
//! use protocol::{Envelope, Frame, FrameCodec, Message};
//!
//! let request = CommandRequest::chdir("reports");
//! let digest = request.fingerprint().unwrap();
//! assert_eq!(digest.len(), 32);
//!
//! let envelope = Envelope::new(1, Message::Command(request));
//! let bytes = envelope.to_msgpack().unwrap();
//!
//! let codec = FrameCodec::new();
//! let frame_bytes = codec.encode(&Frame::new(bytes)).unwrap();
//! assert_eq!(&frame_bytes[..4], b"FSH1");
//! ```

pub mod channel;
pub mod error;
pub mod framing;
pub mod keys;
pub mod messages;
pub mod noise;

pub use channel::{NoiseChannel, SecureChannel};
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use keys::{PublicKey, StaticKeypair, KEY_LENGTH};
pub use messages::{Envelope, Message, DIGEST_LENGTH, PROTOCOL_VERSION};
pub use noise::{
    HandshakePhase, NoiseSession, Role, MAX_NOISE_MESSAGE_SIZE, MAX_PLAINTEXT_SIZE, NOISE_OVERHEAD,
};
