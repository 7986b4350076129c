//! Noise XX handshake and transport encryption.
//!
//! Both ends authenticate with static X25519 keys. The server's static key
//! arrives in the second handshake message, so a client that pins the key
//! can refuse the session before sending its own identity.
//!
//! ## Noise XX Pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```

use snow::{Builder, HandshakeState, TransportState};

use crate::error::{ProtocolError, Result};
use crate::keys::{PublicKey, StaticKeypair, KEY_LENGTH};

/// Noise_XX_25519_ChaChaPoly_BLAKE2s.
pub(crate) const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum size for a single Noise message, handshake or transport.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// Largest plaintext that fits in one transport message.
pub const MAX_PLAINTEXT_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD;

/// State of the Noise handshake process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: ready to send `-> e`
    InitiatorStart,
    /// Initiator: waiting for `<- e, ee, s, es`
    InitiatorWaitingForResponse,
    /// Initiator: ready to send `-> s, se`
    InitiatorSendFinal,
    /// Responder: waiting for `-> e`
    ResponderStart,
    /// Responder: ready to send `<- e, ee, s, es`
    ResponderSendResponse,
    /// Responder: waiting for `-> s, se`
    ResponderWaitingForFinal,
    /// Handshake complete
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (client)
    Initiator,
    /// Responds to the handshake (server)
    Responder,
}

/// A Noise session: the XX handshake state machine followed by transport
/// encryption.
///
/// ```ignore
/// let mut initiator = NoiseSession::new_initiator(&keypair)?;
/// let msg1 = initiator.write_handshake_message(&[])?;
/// // send msg1, receive msg2
/// initiator.read_handshake_message(&msg2)?;
/// let msg3 = initiator.write_handshake_message(&[])?;
/// // send msg3
/// initiator.into_transport()?;
/// ```
pub struct NoiseSession {
    handshake: Option<HandshakeState>,
    transport: Option<TransportState>,
    phase: HandshakePhase,
    role: Role,
    remote_static: Option<PublicKey>,
    buffer: Vec<u8>,
}

impl NoiseSession {
    /// Creates a session that sends the first handshake message.
    pub fn new_initiator(keypair: &StaticKeypair) -> Result<Self> {
        let handshake = Self::builder(keypair)?
            .build_initiator()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build initiator: {}", e)))?;

        Ok(Self::with_state(handshake, HandshakePhase::InitiatorStart, Role::Initiator))
    }

    /// Creates a session that waits for the initiator's first message.
    pub fn new_responder(keypair: &StaticKeypair) -> Result<Self> {
        let handshake = Self::builder(keypair)?
            .build_responder()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build responder: {}", e)))?;

        Ok(Self::with_state(handshake, HandshakePhase::ResponderStart, Role::Responder))
    }

    fn builder(keypair: &StaticKeypair) -> Result<Builder<'_>> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e)))?;
        Ok(Builder::new(params).local_private_key(keypair.private_bytes()))
    }

    fn with_state(handshake: HandshakeState, phase: HandshakePhase, role: Role) -> Self {
        Self {
            handshake: Some(handshake),
            transport: None,
            phase,
            role,
            remote_static: None,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        }
    }

    /// Returns the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Returns whether the session is in transport mode.
    pub fn is_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Writes the next handshake message, carrying `payload`.
    pub fn write_handshake_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Initiator, HandshakePhase::InitiatorSendFinal) => HandshakePhase::Complete,
            (Role::Responder, HandshakePhase::ResponderSendResponse) => {
                HandshakePhase::ResponderWaitingForFinal
            }
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        let len = handshake.write_message(payload, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Reads a handshake message from the peer and returns its payload.
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::InitiatorSendFinal
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            (Role::Responder, HandshakePhase::ResponderWaitingForFinal) => HandshakePhase::Complete,
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        let len = handshake.read_message(message, &mut self.buffer)?;
        let payload = self.buffer[..len].to_vec();

        if let Some(remote) = handshake.get_remote_static() {
            if remote.len() == KEY_LENGTH {
                let mut key = [0u8; KEY_LENGTH];
                key.copy_from_slice(remote);
                self.remote_static = Some(PublicKey::from_bytes(key));
            }
        }

        self.phase = next;
        Ok(payload)
    }

    /// The peer's static public key, once the handshake has delivered it.
    ///
    /// The initiator learns it after reading the second message; the
    /// responder after reading the third.
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static
    }

    /// Switches from handshake to transport mode.
    pub fn into_transport(&mut self) -> Result<()> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        if self.remote_static.is_none() {
            return Err(ProtocolError::HandshakeFailed(
                "remote static key not available".to_string(),
            ));
        }

        let handshake = self
            .handshake
            .take()
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        self.transport = Some(handshake.into_transport_mode()?);
        Ok(())
    }

    /// Encrypts a transport message. The result includes the auth tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                MAX_PLAINTEXT_SIZE
            )));
        }

        let len = transport.write_message(plaintext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Decrypts a transport message.
    ///
    /// Any tampering, truncation, reordering or replay shows up here as
    /// [`ProtocolError::Decryption`], since the transport nonce advances with
    /// every message.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too large: {} bytes exceeds maximum of {} bytes",
                ciphertext.len(),
                MAX_NOISE_MESSAGE_SIZE
            )));
        }

        let len = transport.read_message(ciphertext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("is_transport", &self.transport.is_some())
            .field("remote_static", &self.remote_static)
            .finish()
    }
}
