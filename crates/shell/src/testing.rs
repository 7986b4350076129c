//! Scripted in-memory channel for unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use protocol::{Message, ProtocolError, PublicKey, Result, SecureChannel};

/// A [`SecureChannel`] that records what is sent and replays a script of
/// incoming messages and errors. An exhausted script reads as a closed peer.
#[derive(Debug, Default)]
pub struct MockChannel {
    incoming: VecDeque<Result<Message>>,
    sent: Vec<Message>,
    close_calls: usize,
    open: bool,
    /// File overwritten with new contents when the first message is sent.
    rewrite_on_send: Option<(PathBuf, Vec<u8>)>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            open: true,
            ..Self::default()
        }
    }

    pub fn with_reply(mut self, message: Message) -> Self {
        self.incoming.push_back(Ok(message));
        self
    }

    pub fn with_error(mut self, error: ProtocolError) -> Self {
        self.incoming.push_back(Err(error));
        self
    }

    pub fn rewrite_on_first_send(mut self, path: PathBuf, contents: &[u8]) -> Self {
        self.rewrite_on_send = Some((path, contents.to_vec()));
        self
    }

    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn was_closed(&self) -> bool {
        self.close_calls > 0
    }
}

impl SecureChannel for MockChannel {
    fn send<'a>(
        &'a mut self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !self.open {
                return Err(ProtocolError::ConnectionClosed("mock closed".into()));
            }
            if let Some((path, contents)) = self.rewrite_on_send.take() {
                std::fs::write(path, contents)?;
            }
            self.sent.push(message);
            Ok(())
        })
    }

    fn receive<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>> {
        Box::pin(async move {
            self.incoming
                .pop_front()
                .unwrap_or_else(|| Err(ProtocolError::ConnectionClosed("script exhausted".into())))
        })
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.close_calls += 1;
            self.open = false;
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn remote_static(&self) -> Option<PublicKey> {
        None
    }
}
