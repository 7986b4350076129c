//! Session establishment: TCP connect, Noise handshake, login.

use std::time::Duration;

use protocol::messages::{LoginRequest, LoginResponse};
use protocol::{Message, NoiseChannel, ProtocolError, PublicKey, SecureChannel, StaticKeypair};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::session::Session;

/// Errors raised while establishing a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {seconds}s connecting to {address}")]
    Timeout { address: String, seconds: u64 },

    #[error("secure handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    #[error("login exchange failed: {0}")]
    Exchange(#[source] ProtocolError),

    #[error("login response does not answer the request that was sent")]
    LoginMismatch,

    #[error("login refused: {0}")]
    LoginRefused(String),
}

/// Where to connect and which server key to expect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `host:port` of the server.
    pub address: String,
    /// Bound on TCP connect plus handshake.
    pub timeout: Duration,
    /// When set, the handshake fails unless the server presents this key.
    pub server_key: Option<PublicKey>,
}

/// Opens a TCP connection and runs the Noise handshake as initiator.
pub async fn connect(
    options: &ConnectOptions,
    keypair: &StaticKeypair,
) -> Result<NoiseChannel<TcpStream>, ConnectError> {
    let attempt = async {
        let stream = TcpStream::connect(&options.address)
            .await
            .map_err(|source| ConnectError::Connect {
                address: options.address.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not disable Nagle on client socket");
        }
        handshake(stream, keypair, options.server_key.as_ref()).await
    };

    match tokio::time::timeout(options.timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout {
            address: options.address.clone(),
            seconds: options.timeout.as_secs(),
        }),
    }
}

/// Runs the handshake over an already open stream.
pub async fn handshake<S>(
    stream: S,
    keypair: &StaticKeypair,
    server_key: Option<&PublicKey>,
) -> Result<NoiseChannel<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let channel = NoiseChannel::initiate(stream, keypair, server_key)
        .await
        .map_err(ConnectError::Handshake)?;

    match (server_key, channel.remote_static()) {
        (Some(_), Some(remote)) => tracing::info!(server = %remote, "Server key verified"),
        (None, Some(remote)) => tracing::warn!(
            server = %remote,
            "No server key configured, the server's identity was not checked"
        ),
        (_, None) => {}
    }

    Ok(channel)
}

/// Sends the login request and, if the server accepts it, wraps the
/// channel in a [`Session`].
///
/// The response must echo the SHA-256 of the request; anything else closes
/// the channel.
pub async fn login<C: SecureChannel>(
    mut channel: C,
    request: LoginRequest,
) -> Result<Session<C>, ConnectError> {
    let result = exchange_login(&mut channel, request).await;
    match result {
        Ok(()) => Ok(Session::new(channel)),
        Err(e) => {
            if let Err(close_err) = channel.close().await {
                tracing::debug!(error = %close_err, "Error while closing channel");
            }
            Err(e)
        }
    }
}

async fn exchange_login<C: SecureChannel>(
    channel: &mut C,
    request: LoginRequest,
) -> Result<(), ConnectError> {
    let username = request.username.clone();
    let expected = request
        .fingerprint()
        .map_err(|e| ConnectError::Exchange(e.into()))?;

    channel
        .send(Message::LoginRequest(request))
        .await
        .map_err(ConnectError::Exchange)?;

    let response: LoginResponse = match channel.receive().await.map_err(ConnectError::Exchange)? {
        Message::LoginResponse(response) => response,
        other => {
            return Err(ConnectError::Exchange(ProtocolError::UnexpectedMessage {
                expected: "LoginResponse",
                got: other.kind(),
            }));
        }
    };

    if response.request_digest.as_slice() != expected.as_slice() {
        tracing::warn!("Login response digest does not match the request");
        return Err(ConnectError::LoginMismatch);
    }

    if !response.accepted {
        let reason = response
            .reason
            .unwrap_or_else(|| "invalid credentials".to_string());
        tracing::info!(%username, %reason, "Login refused");
        return Err(ConnectError::LoginRefused(reason));
    }

    tracing::info!(%username, "Logged in");
    Ok(())
}
