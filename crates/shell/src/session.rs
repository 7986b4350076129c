//! The command/response exchange and the fail-closed session handle.
//!
//! A [`Session`] owns the secure channel for the life of the shell. Every
//! operation takes it by `&mut`, so only one command or transfer can be in
//! flight at a time. Any error that means the channel can no longer be
//! trusted, or is simply gone, closes the session on the spot; after that
//! every call fails with [`ShellError::SessionClosed`].

use protocol::messages::{CommandRequest, CommandResponse};
use protocol::{Message, ProtocolError, SecureChannel};

use crate::error::ShellError;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The user asked to leave.
    UserExit,
    /// A received message failed verification.
    VerificationFailed,
    /// The transport went away.
    ConnectionLost,
}

/// The single long-lived channel handle shared by every operation.
pub struct Session<C> {
    channel: C,
    closed: Option<CloseReason>,
}

impl<C: SecureChannel> Session<C> {
    /// Wraps an established channel.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            closed: None,
        }
    }

    /// Returns whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Why the session was closed, if it has been.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Closes the session. Only the first call has any effect.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason);
        tracing::info!(?reason, "Closing session");

        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "Error while closing channel");
        }
    }

    /// Sends one command and returns its single verified response.
    ///
    /// The response must be a `CommandResult` whose `request_digest` equals
    /// the SHA-256 of the request just sent. The outcome is not interpreted.
    pub async fn execute(&mut self, request: CommandRequest) -> Result<CommandResponse, ShellError> {
        self.ensure_open()?;

        let command = request.command;
        let expected_digest = match request.fingerprint() {
            Ok(digest) => digest,
            Err(e) => return Err(self.fail(ProtocolError::from(e).into()).await),
        };

        tracing::debug!(?command, argument = ?request.argument, "Sending command");
        self.send(Message::Command(request)).await?;

        let response = match self.receive().await? {
            Message::CommandResult(response) => response,
            other => {
                return Err(self
                    .unexpected("CommandResult", other.kind())
                    .await);
            }
        };

        if response.request_digest.as_slice() != expected_digest.as_slice() {
            tracing::warn!(?command, "Response digest does not match the request");
            return Err(self
                .fail(ShellError::Verification(
                    "response does not answer the request that was sent".to_string(),
                ))
                .await);
        }

        tracing::debug!(?command, outcome = ?response.outcome, "Received response");
        Ok(response)
    }

    /// Sends a message, closing the session on a fatal error.
    pub(crate) async fn send(&mut self, message: Message) -> Result<(), ShellError> {
        self.ensure_open()?;
        match self.channel.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    /// Receives a message, closing the session on a fatal error.
    pub(crate) async fn receive(&mut self) -> Result<Message, ShellError> {
        self.ensure_open()?;
        match self.channel.receive().await {
            Ok(message) => Ok(message),
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    /// Fails the session because a message of the wrong kind arrived.
    pub(crate) async fn unexpected(&mut self, expected: &'static str, got: &'static str) -> ShellError {
        self.fail(ProtocolError::UnexpectedMessage { expected, got }.into())
            .await
    }

    /// Closes the session if `err` is fatal, then hands the error back.
    pub(crate) async fn fail(&mut self, err: ShellError) -> ShellError {
        match &err {
            ShellError::Verification(reason) => {
                tracing::error!(%reason, "Verification failed");
                self.close(CloseReason::VerificationFailed).await;
            }
            ShellError::ConnectionLost(reason) => {
                tracing::error!(%reason, "Connection lost");
                self.close(CloseReason::ConnectionLost).await;
            }
            _ => {}
        }
        err
    }

    fn ensure_open(&self) -> Result<(), ShellError> {
        if self.closed.is_some() || !self.channel.is_open() {
            return Err(ShellError::SessionClosed);
        }
        Ok(())
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
