//! Secure message channel over a byte stream.
//!
//! [`SecureChannel`] is the interface the client's session layer talks to:
//! ordered, encrypted delivery of whole [`Message`]s. [`NoiseChannel`] is the
//! implementation used on real connections. It runs the Noise XX handshake
//! over [`FrameCodec`] frames, then carries one MessagePack [`Envelope`] per
//! Noise transport message.
//!
//! Every received envelope is checked before its payload is handed out:
//!
//! - the Noise AEAD tag (tampering, truncation, reordering, replay)
//! - MessagePack decoding (unknown variants, malformed fields)
//! - the protocol version
//! - the sequence number, which must be exactly one more than the last
//!
//! Once a received message fails any of these checks the channel is marked
//! closed; it cannot be resynchronized.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::framing::{Frame, FrameCodec};
use crate::keys::{PublicKey, StaticKeypair};
use crate::messages::{Envelope, Message, PROTOCOL_VERSION};
use crate::noise::NoiseSession;

/// An ordered, authenticated, encrypted message channel to one peer.
pub trait SecureChannel: Send {
    /// Encrypts and sends one message.
    fn send<'a>(
        &'a mut self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Waits for the next message and returns it once it has passed every
    /// channel-level check.
    fn receive<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>>;

    /// Closes the channel. Closing twice is a no-op.
    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Returns whether the channel can still carry messages.
    fn is_open(&self) -> bool;

    /// The peer's static public key from the handshake.
    fn remote_static(&self) -> Option<PublicKey>;
}

/// A [`SecureChannel`] over any async byte stream, secured with Noise XX.
pub struct NoiseChannel<S> {
    stream: S,
    session: NoiseSession,
    codec: FrameCodec,
    read_buffer: Vec<u8>,
    /// Sequence number of the next outgoing envelope.
    send_sequence: u64,
    /// Sequence number the next incoming envelope must carry.
    recv_sequence: u64,
    open: bool,
    /// Set once the write half is shut down. A failed receive clears `open`
    /// but leaves this unset.
    shut_down: bool,
}

impl<S> NoiseChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the handshake as initiator.
    ///
    /// When `expected_server` is given, the responder's static key must equal
    /// it. The check happens after the second handshake message, so a
    /// mismatched server never receives our static key.
    pub async fn initiate(
        mut stream: S,
        keypair: &StaticKeypair,
        expected_server: Option<&PublicKey>,
    ) -> Result<Self> {
        let codec = FrameCodec::new();
        let mut read_buffer = Vec::new();
        let mut session = NoiseSession::new_initiator(keypair)?;

        let msg1 = session.write_handshake_message(&[])?;
        codec.write_frame(&mut stream, &Frame::new(msg1)).await?;

        let msg2 = codec.read_frame(&mut stream, &mut read_buffer).await?;
        session.read_handshake_message(&msg2.payload)?;

        let remote = session.remote_static().ok_or_else(|| {
            ProtocolError::HandshakeFailed("responder did not send a static key".to_string())
        })?;
        if let Some(expected) = expected_server {
            if remote != *expected {
                tracing::warn!(
                    expected = %expected,
                    got = %remote,
                    "Server static key does not match the pinned key"
                );
                return Err(ProtocolError::HandshakeFailed(format!(
                    "server key {} does not match pinned key {}",
                    remote, expected
                )));
            }
        }

        let msg3 = session.write_handshake_message(&[])?;
        codec.write_frame(&mut stream, &Frame::new(msg3)).await?;
        session.into_transport()?;

        tracing::debug!(server = %remote, "Noise handshake complete");
        Ok(Self::established(stream, session, codec, read_buffer))
    }

    /// Runs the handshake as responder.
    pub async fn accept(mut stream: S, keypair: &StaticKeypair) -> Result<Self> {
        let codec = FrameCodec::new();
        let mut read_buffer = Vec::new();
        let mut session = NoiseSession::new_responder(keypair)?;

        let msg1 = codec.read_frame(&mut stream, &mut read_buffer).await?;
        session.read_handshake_message(&msg1.payload)?;

        let msg2 = session.write_handshake_message(&[])?;
        codec.write_frame(&mut stream, &Frame::new(msg2)).await?;

        let msg3 = codec.read_frame(&mut stream, &mut read_buffer).await?;
        session.read_handshake_message(&msg3.payload)?;
        session.into_transport()?;

        tracing::debug!(client = ?session.remote_static(), "Noise handshake complete");
        Ok(Self::established(stream, session, codec, read_buffer))
    }

    fn established(
        stream: S,
        session: NoiseSession,
        codec: FrameCodec,
        read_buffer: Vec<u8>,
    ) -> Self {
        Self {
            stream,
            session,
            codec,
            read_buffer,
            send_sequence: 1,
            recv_sequence: 1,
            open: true,
            shut_down: false,
        }
    }

    /// Sends one message.
    pub async fn send_message(&mut self, message: Message) -> Result<()> {
        if !self.open {
            return Err(ProtocolError::ConnectionClosed("channel is closed".to_string()));
        }

        let kind = message.kind();
        let envelope = Envelope::new(self.send_sequence, message);
        let plaintext = envelope.to_msgpack()?;
        let ciphertext = self.session.encrypt(&plaintext)?;

        if let Err(e) = self
            .codec
            .write_frame(&mut self.stream, &Frame::new(ciphertext))
            .await
        {
            self.open = false;
            return Err(e);
        }

        tracing::trace!(sequence = self.send_sequence, kind, "Sent message");
        self.send_sequence += 1;
        Ok(())
    }

    /// Receives and verifies one message.
    pub async fn receive_message(&mut self) -> Result<Message> {
        if !self.open {
            return Err(ProtocolError::ConnectionClosed("channel is closed".to_string()));
        }

        match self.read_envelope().await {
            Ok(message) => Ok(message),
            Err(e) => {
                self.open = false;
                Err(e)
            }
        }
    }

    async fn read_envelope(&mut self) -> Result<Message> {
        let frame = self
            .codec
            .read_frame(&mut self.stream, &mut self.read_buffer)
            .await?;
        let plaintext = self.session.decrypt(&frame.payload)?;
        let envelope = Envelope::from_msgpack(&plaintext)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: envelope.version,
            });
        }
        if envelope.sequence != self.recv_sequence {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.recv_sequence,
                got: envelope.sequence,
            });
        }

        tracing::trace!(
            sequence = envelope.sequence,
            kind = envelope.payload.kind(),
            "Received message"
        );
        self.recv_sequence += 1;
        Ok(envelope.payload)
    }

    /// Shuts down the write half of the stream, even when a failed send or
    /// receive has already marked the channel closed.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.open = false;
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S> SecureChannel for NoiseChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send<'a>(
        &'a mut self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.send_message(message))
    }

    fn receive<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>> {
        Box::pin(self.receive_message())
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.shutdown())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn remote_static(&self) -> Option<PublicKey> {
        self.session.remote_static()
    }
}

impl<S> std::fmt::Debug for NoiseChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseChannel")
            .field("session", &self.session)
            .field("send_sequence", &self.send_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .field("open", &self.open)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CommandRequest, DownloadControl, FileChunk};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    async fn connected_pair() -> (NoiseChannel<DuplexStream>, NoiseChannel<DuplexStream>) {
        let client_key = StaticKeypair::generate().unwrap();
        let server_key = StaticKeypair::generate().unwrap();
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move { NoiseChannel::accept(server_io, &server_key).await });
        let client = NoiseChannel::initiate(client_io, &client_key, None).await.unwrap();
        let server = server.await.unwrap().unwrap();
        (client, server)
    }

    /// Encrypts an arbitrary envelope on `channel` without touching its
    /// sequence counter.
    async fn send_raw(channel: &mut NoiseChannel<DuplexStream>, envelope: Envelope) {
        let ciphertext = channel.session.encrypt(&envelope.to_msgpack().unwrap()).unwrap();
        channel
            .codec
            .write_frame(&mut channel.stream, &Frame::new(ciphertext))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (mut client, mut server) = connected_pair().await;

        client
            .send(Message::Command(CommandRequest::pwd()))
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Message::Command(CommandRequest::pwd())
        );

        server
            .send(Message::DownloadControl(DownloadControl::Ready))
            .await
            .unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Message::DownloadControl(DownloadControl::Ready)
        );

        assert_eq!(client.send_sequence, 2);
        assert_eq!(client.recv_sequence, 2);
    }

    #[tokio::test]
    async fn test_both_sides_learn_static_keys() {
        let client_key = StaticKeypair::generate().unwrap();
        let server_key = StaticKeypair::generate().unwrap();
        let server_public = server_key.public();
        let client_public = client_key.public();
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move { NoiseChannel::accept(server_io, &server_key).await });
        let client = NoiseChannel::initiate(client_io, &client_key, Some(&server_public))
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(client.remote_static(), Some(server_public));
        assert_eq!(server.remote_static(), Some(client_public));
    }

    #[tokio::test]
    async fn test_pinned_key_mismatch_aborts_handshake() {
        let client_key = StaticKeypair::generate().unwrap();
        let server_key = StaticKeypair::generate().unwrap();
        let wrong = StaticKeypair::generate().unwrap().public();
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move { NoiseChannel::accept(server_io, &server_key).await });
        let err = NoiseChannel::initiate(client_io, &client_key, Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed(_)));

        // The client stream is dropped before the third message.
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_sequence_gap_is_rejected_and_closes_channel() {
        let (mut client, mut server) = connected_pair().await;

        let skipped = Envelope::new(2, Message::Command(CommandRequest::list()));
        send_raw(&mut client, skipped).await;

        let err = server.receive().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SequenceMismatch { expected: 1, got: 2 }
        ));
        assert!(err.is_integrity_failure());
        assert!(!server.is_open());
        assert!(matches!(
            server.receive().await,
            Err(ProtocolError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_sequence_is_rejected() {
        let (mut client, mut server) = connected_pair().await;

        client
            .send(Message::Command(CommandRequest::pwd()))
            .await
            .unwrap();
        server.receive().await.unwrap();

        let replay = Envelope::new(1, Message::Command(CommandRequest::delete("notes.txt")));
        send_raw(&mut client, replay).await;

        let err = server.receive().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SequenceMismatch { expected: 2, got: 1 }
        ));
    }

    #[tokio::test]
    async fn test_wrong_version_is_rejected() {
        let (mut client, mut server) = connected_pair().await;

        let mut envelope = Envelope::new(1, Message::Command(CommandRequest::pwd()));
        envelope.version = PROTOCOL_VERSION + 1;
        send_raw(&mut client, envelope).await;

        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_tampered_frame_fails_decryption() {
        let client_key = StaticKeypair::generate().unwrap();
        let server_key = StaticKeypair::generate().unwrap();
        let (client_io, relay_in) = duplex(64 * 1024);
        let (relay_out, server_io) = duplex(64 * 1024);

        // Relay forwards the handshake untouched, then flips one byte of the
        // first transport frame's ciphertext.
        let relay = tokio::spawn(async move {
            let codec = FrameCodec::new();
            let (mut from_client, mut to_client) = tokio::io::split(relay_in);
            let (mut from_server, mut to_server) = tokio::io::split(relay_out);
            let mut client_buf = Vec::new();
            let mut server_buf = Vec::new();

            let msg1 = codec.read_frame(&mut from_client, &mut client_buf).await.unwrap();
            codec.write_frame(&mut to_server, &msg1).await.unwrap();
            let msg2 = codec.read_frame(&mut from_server, &mut server_buf).await.unwrap();
            codec.write_frame(&mut to_client, &msg2).await.unwrap();
            let msg3 = codec.read_frame(&mut from_client, &mut client_buf).await.unwrap();
            codec.write_frame(&mut to_server, &msg3).await.unwrap();

            let mut data = codec.read_frame(&mut from_client, &mut client_buf).await.unwrap();
            let last = data.payload.len() - 1;
            data.payload[last] ^= 0x01;
            codec.write_frame(&mut to_server, &data).await.unwrap();
            (from_client, to_client, from_server, to_server)
        });

        let server = tokio::spawn(async move { NoiseChannel::accept(server_io, &server_key).await });
        let mut client = NoiseChannel::initiate(client_io, &client_key, None).await.unwrap();
        let mut server = server.await.unwrap().unwrap();

        client
            .send(Message::FileChunk(FileChunk {
                data: b"payload".to_vec(),
                last: true,
            }))
            .await
            .unwrap();

        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decryption(_)));
        assert!(err.is_integrity_failure());
        let _halves = relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_closed() {
        let (mut client, server) = connected_pair().await;
        drop(server);

        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
        assert!(!err.is_integrity_failure());
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, mut server) = connected_pair().await;

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_open());
        assert!(client.send(Message::Command(CommandRequest::pwd())).await.is_err());

        let mut rest = Vec::new();
        server.stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_close_after_failed_receive_releases_stream() {
        let (mut client, mut server) = connected_pair().await;

        let skipped = Envelope::new(7, Message::Command(CommandRequest::pwd()));
        send_raw(&mut server, skipped).await;

        let err = client.receive().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SequenceMismatch { expected: 1, got: 7 }
        ));
        assert!(!client.is_open());

        client.close().await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.stream.read_to_end(&mut rest),
        )
        .await
        .expect("peer should see EOF after close");
        read.unwrap();
        assert!(rest.is_empty());
    }
}
