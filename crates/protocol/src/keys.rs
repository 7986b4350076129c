//! Static X25519 keys used by the Noise handshake.
//!
//! The client keeps one long-lived keypair on disk and may pin the server's
//! public key in its configuration. Keys are stored and displayed as hex.

use std::fmt;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use snow::Builder;

use crate::error::{ProtocolError, Result};
use crate::noise::NOISE_PATTERN;

/// Length of an X25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Number of hash bytes shown in a fingerprint.
const FINGERPRINT_LENGTH: usize = 16;

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Parses a key from 64 hex characters. Colons and whitespace are ignored
    /// so a pasted fingerprint-style string still parses.
    pub fn from_hex(s: &str) -> Result<Self> {
        let cleaned: String = s
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .collect();
        Ok(Self(decode_key(&cleaned)?))
    }

    /// Hex encoding of the key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short human-readable fingerprint: the first 16 bytes of SHA-256 over
    /// the key, as colon-separated groups of 4 hex characters.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.0);
        hash[..FINGERPRINT_LENGTH]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A static X25519 keypair.
#[derive(Clone)]
pub struct StaticKeypair {
    private: [u8; KEY_LENGTH],
    public: PublicKey,
}

impl StaticKeypair {
    /// Generates a fresh keypair with the Noise library's resolver.
    pub fn generate() -> Result<Self> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| ProtocolError::InvalidKey(format!("invalid noise pattern: {}", e)))?;
        let keypair = Builder::new(params).generate_keypair()?;

        let mut private = [0u8; KEY_LENGTH];
        private.copy_from_slice(&keypair.private);
        let mut public = [0u8; KEY_LENGTH];
        public.copy_from_slice(&keypair.public);

        Ok(Self {
            private,
            public: PublicKey(public),
        })
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// The private half, for building Noise sessions.
    pub(crate) fn private_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.private
    }

    /// Serializes the keypair as two hex lines: private key, then public key.
    pub fn to_file_contents(&self) -> String {
        format!("{}\n{}\n", hex::encode(self.private), self.public.to_hex())
    }

    /// Parses the format written by [`StaticKeypair::to_file_contents`].
    pub fn from_file_contents(contents: &str) -> Result<Self> {
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
        let private = lines
            .next()
            .ok_or_else(|| ProtocolError::InvalidKey("missing private key".to_string()))?;
        let public = lines
            .next()
            .ok_or_else(|| ProtocolError::InvalidKey("missing public key".to_string()))?;

        Ok(Self {
            private: decode_key(private)?,
            public: PublicKey::from_hex(public)?,
        })
    }

    /// Loads the keypair at `path`, generating and saving a new one if the
    /// file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            return Self::from_file_contents(&contents);
        }

        let keypair = Self::generate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, keypair.to_file_contents())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), fingerprint = %keypair.public, "Generated new static key");
        Ok(keypair)
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn decode_key(s: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
    if bytes.len() != KEY_LENGTH {
        return Err(ProtocolError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LENGTH,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}
