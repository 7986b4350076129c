//! Upload and download orchestration.
//!
//! Both directions start with a metadata command through
//! [`Session::execute`]. A `Success` answer hands the channel to a content
//! sub-protocol:
//!
//! ```text
//! upload:    Command(UPLOAD name size digest) -> CommandResult
//!            FileChunk* (last = true on the final one) -> UploadReceipt
//!
//! download:  Command(DOWNLOAD name) -> CommandResult(size, digest)
//!            DownloadControl(Ready)  -> FileChunk* (last = true on the final one)
//!            DownloadControl(Cancel)
//! ```
//!
//! A problem in the streaming phase is a [`ShellError::Transfer`] and leaves
//! the session usable. The orchestrators always finish the sub-protocol
//! (the final chunk is sent, or incoming chunks are drained up to the final
//! one) before reporting it, so the next command starts in step with the
//! peer.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use protocol::messages::{
    CommandOutcome, CommandRequest, CommandResponse, DownloadControl, FileChunk,
};
use protocol::{Message, SecureChannel, DIGEST_LENGTH};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::digest::{base_name, to_hex, DigestAccumulator, FileDescriptor};
use crate::error::ShellError;
use crate::session::Session;

/// Which way the file bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local file to the server.
    Upload,
    /// Server file to the local disk.
    Download,
}

/// Progress of one transfer attempt.
///
/// ```text
/// Requested -> Rejected
/// Requested -> Transferring -> Completed | Failed                 (upload)
/// Requested -> Offered -> Confirmed -> Transferring -> Completed | Failed
///                      -> Declined  -> Cancelled                  (download)
/// ```
///
/// A download whose destination cannot be prepared goes from `Confirmed`
/// straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Rejected,
    Offered,
    Confirmed,
    Declined,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Returns true for states with no way out.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Rejected
                | TransferState::Completed
                | TransferState::Failed
                | TransferState::Cancelled
        )
    }
}

/// An attempted change between two states the machine does not connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal {direction:?} state change: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub direction: TransferDirection,
    pub from: TransferState,
    pub to: TransferState,
}

impl From<InvalidTransition> for ShellError {
    fn from(err: InvalidTransition) -> Self {
        ShellError::Transfer(err.to_string())
    }
}

/// One upload or download attempt and the descriptor it is moving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAttempt {
    direction: TransferDirection,
    name: String,
    size: Option<u64>,
    digest: Option<[u8; DIGEST_LENGTH]>,
    state: TransferState,
}

impl TransferAttempt {
    /// An upload of an already digested file.
    pub fn upload(descriptor: &FileDescriptor) -> Self {
        Self {
            direction: TransferDirection::Upload,
            name: descriptor.name.clone(),
            size: Some(descriptor.size),
            digest: Some(descriptor.digest),
            state: TransferState::Requested,
        }
    }

    /// A download whose size and digest are not known yet.
    pub fn download(name: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Download,
            name: name.into(),
            size: None,
            digest: None,
            state: TransferState::Requested,
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Announced size, once known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Announced digest, once known.
    pub fn digest(&self) -> Option<&[u8; DIGEST_LENGTH]> {
        self.digest.as_ref()
    }

    /// Records the server's offer and moves a download to `Offered`.
    pub fn offer(&mut self, size: u64, digest: [u8; DIGEST_LENGTH]) -> Result<(), InvalidTransition> {
        self.advance(TransferState::Offered)?;
        self.size = Some(size);
        self.digest = Some(digest);
        Ok(())
    }

    /// Moves to `next`, refusing transitions the machine does not allow.
    pub fn advance(&mut self, next: TransferState) -> Result<(), InvalidTransition> {
        use TransferDirection::*;
        use TransferState::*;

        let allowed = match (self.direction, self.state, next) {
            (_, Requested, Rejected) => true,
            (Upload, Requested, Transferring) => true,
            (Download, Requested, Offered) => true,
            (Download, Offered, Confirmed | Declined) => true,
            (Download, Confirmed, Transferring | Failed) => true,
            (Download, Declined, Cancelled) => true,
            (_, Transferring, Completed | Failed) => true,
            _ => false,
        };

        if !allowed {
            return Err(InvalidTransition {
                direction: self.direction,
                from: self.state,
                to: next,
            });
        }

        tracing::trace!(name = %self.name, from = ?self.state, to = ?next, "Transfer state change");
        self.state = next;
        Ok(())
    }
}

/// What the server said it has for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOffer {
    /// Remote file name as requested.
    pub name: String,
    /// Announced size in bytes.
    pub size: u64,
    /// Announced SHA-256.
    pub digest: [u8; DIGEST_LENGTH],
}

impl DownloadOffer {
    pub fn digest_hex(&self) -> String {
        to_hex(&self.digest)
    }
}

/// The user-consent gate in front of every download.
pub trait Confirm: Send {
    /// Returns true to accept the offer.
    fn confirm<'a>(
        &'a mut self,
        offer: &'a DownloadOffer,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Parses an answer to the download prompt.
///
/// Accepts `y`, `yes`, `n` and `no` in any case, ignoring surrounding
/// whitespace. Anything else is `None` and should be asked again.
pub fn parse_confirmation(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// How an upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server stored exactly the announced bytes.
    Completed(FileDescriptor),
    /// The server answered the UPLOAD command with `Reject` or `Failure`.
    /// No file content was sent.
    Rejected {
        outcome: CommandOutcome,
        reason: String,
    },
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadReport {
    /// The server answered the DOWNLOAD command with `Reject` or `Failure`.
    Rejected {
        outcome: CommandOutcome,
        reason: String,
    },
    /// The user declined the offer and the server was told to cancel.
    Cancelled(DownloadOffer),
    /// All announced bytes were received and stored at `path`.
    Completed {
        offer: DownloadOffer,
        path: PathBuf,
        /// SHA-256 of the bytes actually received.
        local_digest: [u8; DIGEST_LENGTH],
        /// False means the received bytes do not hash to the announced
        /// digest. The file is kept; this is a warning.
        digest_matches: bool,
    },
}

/// Uploads `local_path` through `session`.
///
/// The descriptor is built before anything is sent, so a missing or
/// unreadable file fails with [`ShellError::LocalIo`] without a round-trip.
pub async fn upload<C: SecureChannel>(
    session: &mut Session<C>,
    local_path: &Path,
    chunk_size: usize,
) -> Result<UploadOutcome, ShellError> {
    let descriptor = FileDescriptor::from_path(local_path, chunk_size)?;
    let mut attempt = TransferAttempt::upload(&descriptor);

    let request = CommandRequest::upload(&descriptor.name, descriptor.size, descriptor.digest);
    let response = session.execute(request).await?;
    if let Some((outcome, reason)) = refusal(&response) {
        attempt.advance(TransferState::Rejected)?;
        tracing::info!(name = %descriptor.name, ?outcome, %reason, "Upload refused");
        return Ok(UploadOutcome::Rejected { outcome, reason });
    }

    attempt.advance(TransferState::Transferring)?;
    tracing::info!(
        name = %descriptor.name,
        size = descriptor.size,
        digest = %descriptor.digest_hex(),
        "Starting upload"
    );

    let streamed = stream_file(session, local_path, chunk_size).await?;

    let receipt = match session.receive().await? {
        Message::UploadReceipt(receipt) => receipt,
        other => return Err(session.unexpected("UploadReceipt", other.kind()).await),
    };

    let result = check_upload(&descriptor, local_path, streamed, receipt.size, &receipt.digest);
    match result {
        Ok(()) => {
            attempt.advance(TransferState::Completed)?;
            tracing::info!(name = %descriptor.name, size = descriptor.size, "Upload completed");
            Ok(UploadOutcome::Completed(descriptor))
        }
        Err(e) => {
            attempt.advance(TransferState::Failed)?;
            tracing::warn!(name = %descriptor.name, error = %e, "Upload failed");
            Err(e)
        }
    }
}

/// What was actually put on the wire during an upload.
struct Streamed {
    size: u64,
    digest: [u8; DIGEST_LENGTH],
    read_error: Option<std::io::Error>,
}

/// Sends the file as `FileChunk`s, always ending with a `last` chunk.
///
/// A read error stops the stream early but still sends the closing chunk,
/// so the server sees a short upload instead of waiting forever.
async fn stream_file<C: SecureChannel>(
    session: &mut Session<C>,
    path: &Path,
    chunk_size: usize,
) -> Result<Streamed, ShellError> {
    let chunk_size = chunk_size.max(1);
    let mut accumulator = DigestAccumulator::new();
    let mut pending: Option<Vec<u8>> = None;
    let mut read_error = None;

    match tokio::fs::File::open(path).await {
        Ok(mut file) => loop {
            match read_chunk(&mut file, chunk_size).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    if let Some(previous) = pending.replace(chunk) {
                        accumulator.update(&previous);
                        session
                            .send(Message::FileChunk(FileChunk {
                                data: previous,
                                last: false,
                            }))
                            .await?;
                    }
                }
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        },
        Err(e) => read_error = Some(e),
    }

    let data = pending.unwrap_or_default();
    accumulator.update(&data);
    session
        .send(Message::FileChunk(FileChunk { data, last: true }))
        .await?;

    let (size, digest) = accumulator.finalize();
    Ok(Streamed {
        size,
        digest,
        read_error,
    })
}

/// Reads up to `chunk_size` bytes, returning fewer only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, chunk_size: usize) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

fn check_upload(
    descriptor: &FileDescriptor,
    path: &Path,
    streamed: Streamed,
    stored_size: u64,
    stored_digest: &[u8],
) -> Result<(), ShellError> {
    if let Some(e) = streamed.read_error {
        return Err(ShellError::Transfer(format!(
            "reading {} failed after {} bytes: {}",
            path.display(),
            streamed.size,
            e
        )));
    }

    if streamed.size != descriptor.size || streamed.digest != descriptor.digest {
        return Err(ShellError::Transfer(format!(
            "local file changed during upload: announced {} bytes ({}), sent {} bytes ({})",
            descriptor.size,
            descriptor.digest_hex(),
            streamed.size,
            to_hex(&streamed.digest)
        )));
    }

    if stored_size != descriptor.size || stored_digest != descriptor.digest.as_slice() {
        return Err(ShellError::Transfer(format!(
            "server stored {} bytes ({}), expected {} bytes ({})",
            stored_size,
            to_hex(stored_digest),
            descriptor.size,
            descriptor.digest_hex()
        )));
    }

    Ok(())
}

/// Downloads `remote_name` into `dest_dir` through `session`, asking
/// `confirm` before any bytes move.
pub async fn download<C: SecureChannel>(
    session: &mut Session<C>,
    remote_name: &str,
    dest_dir: &Path,
    confirm: &mut dyn Confirm,
) -> Result<DownloadReport, ShellError> {
    let mut attempt = TransferAttempt::download(remote_name);

    let response = session.execute(CommandRequest::download(remote_name)).await?;
    if let Some((outcome, reason)) = refusal(&response) {
        attempt.advance(TransferState::Rejected)?;
        tracing::info!(name = remote_name, ?outcome, %reason, "Download refused");
        return Ok(DownloadReport::Rejected { outcome, reason });
    }

    let offer = match offer_from(remote_name, &response) {
        Some(offer) => offer,
        None => {
            return Err(session
                .fail(ShellError::Verification(
                    "download offer is missing its size or digest".to_string(),
                ))
                .await);
        }
    };
    attempt.offer(offer.size, offer.digest)?;

    if !confirm.confirm(&offer).await {
        attempt.advance(TransferState::Declined)?;
        session
            .send(Message::DownloadControl(DownloadControl::Cancel))
            .await?;
        attempt.advance(TransferState::Cancelled)?;
        tracing::info!(name = remote_name, "Download declined");
        return Ok(DownloadReport::Cancelled(offer));
    }
    attempt.advance(TransferState::Confirmed)?;

    let (target, temp) = match prepare_destination(remote_name, dest_dir) {
        Ok(prepared) => prepared,
        Err(e) => {
            session
                .send(Message::DownloadControl(DownloadControl::Cancel))
                .await?;
            attempt.advance(TransferState::Failed)?;
            return Err(e);
        }
    };

    session
        .send(Message::DownloadControl(DownloadControl::Ready))
        .await?;
    attempt.advance(TransferState::Transferring)?;
    tracing::info!(
        name = remote_name,
        size = offer.size,
        digest = %offer.digest_hex(),
        "Starting download"
    );

    let received = receive_file(session, &temp, offer.size).await?;
    let local_digest = match received {
        Ok(digest) => digest,
        Err(e) => {
            attempt.advance(TransferState::Failed)?;
            tracing::warn!(name = remote_name, error = %e, "Download failed");
            return Err(e);
        }
    };

    if let Err(e) = temp.persist(&target) {
        attempt.advance(TransferState::Failed)?;
        return Err(ShellError::local_io(&target, e.error));
    }

    attempt.advance(TransferState::Completed)?;
    let digest_matches = local_digest == offer.digest;
    if digest_matches {
        tracing::info!(name = remote_name, path = %target.display(), "Download completed");
    } else {
        tracing::warn!(
            name = remote_name,
            expected = %offer.digest_hex(),
            got = %to_hex(&local_digest),
            "Downloaded file does not match the announced digest"
        );
    }

    Ok(DownloadReport::Completed {
        offer,
        path: target,
        local_digest,
        digest_matches,
    })
}

/// Picks the final path and creates the temporary file next to it.
fn prepare_destination(
    remote_name: &str,
    dest_dir: &Path,
) -> Result<(PathBuf, tempfile::NamedTempFile), ShellError> {
    let file_name = base_name(Path::new(remote_name))
        .filter(|name| name != "." && name != "..")
        .ok_or_else(|| {
            ShellError::local_io(
                remote_name,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no usable file name"),
            )
        })?;

    let temp = tempfile::Builder::new()
        .prefix(".fileshell-")
        .suffix(".part")
        .tempfile_in(dest_dir)
        .map_err(|e| ShellError::local_io(dest_dir, e))?;

    Ok((dest_dir.join(file_name), temp))
}

/// Receives chunks up to and including the `last` one, writing at most
/// `size` bytes into `temp`.
///
/// The outer `Result` carries fatal channel errors. The inner one carries
/// transfer problems, which are reported only after the stream has ended.
async fn receive_file<C: SecureChannel>(
    session: &mut Session<C>,
    temp: &tempfile::NamedTempFile,
    size: u64,
) -> Result<Result<[u8; DIGEST_LENGTH], ShellError>, ShellError> {
    let mut accumulator = DigestAccumulator::new();
    let mut problem: Option<ShellError> = None;
    let mut output = match temp.as_file().try_clone() {
        Ok(file) => Some(tokio::fs::File::from_std(file)),
        Err(e) => {
            problem = Some(ShellError::local_io(temp.path(), e));
            None
        }
    };

    loop {
        let chunk = match session.receive().await? {
            Message::FileChunk(chunk) => chunk,
            other => return Err(session.unexpected("FileChunk", other.kind()).await),
        };

        if problem.is_none() {
            let total = accumulator.bytes() + chunk.data.len() as u64;
            if total > size {
                problem = Some(ShellError::Transfer(format!(
                    "server sent more than the announced {} bytes",
                    size
                )));
            } else if let Some(file) = output.as_mut() {
                match file.write_all(&chunk.data).await {
                    Ok(()) => accumulator.update(&chunk.data),
                    Err(e) => problem = Some(ShellError::local_io(temp.path(), e)),
                }
            }
        }

        if chunk.last {
            break;
        }
    }

    if let Some(problem) = problem {
        return Ok(Err(problem));
    }

    if accumulator.bytes() < size {
        return Ok(Err(ShellError::Transfer(format!(
            "stream ended after {} of {} bytes",
            accumulator.bytes(),
            size
        ))));
    }

    if let Some(mut file) = output {
        if let Err(e) = file.flush().await {
            return Ok(Err(ShellError::local_io(temp.path(), e)));
        }
        if let Err(e) = file.sync_all().await {
            return Ok(Err(ShellError::local_io(temp.path(), e)));
        }
    }

    let (_, digest) = accumulator.finalize();
    Ok(Ok(digest))
}

/// `Some((outcome, reason))` when the server did not answer `Success`.
fn refusal(response: &CommandResponse) -> Option<(CommandOutcome, String)> {
    match response.outcome {
        CommandOutcome::Success => None,
        outcome => Some((outcome, response.detail.clone().unwrap_or_default())),
    }
}

fn offer_from(name: &str, response: &CommandResponse) -> Option<DownloadOffer> {
    let size = response.size?;
    let digest: [u8; DIGEST_LENGTH] = response.digest.as_deref()?.try_into().ok()?;
    Some(DownloadOffer {
        name: name.to_string(),
        size,
        digest,
    })
}
