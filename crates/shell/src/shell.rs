//! The interactive command loop.
//!
//! Reads one line at a time, turns it into a [`ShellCommand`], runs it
//! against the [`Session`] and prints the result. The loop ends on `bye`,
//! at end of input, or as soon as the session is closed by a fatal error.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use protocol::messages::{CommandOutcome, CommandRequest, CommandResponse};
use protocol::SecureChannel;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ShellError;
use crate::session::{CloseReason, Session};
use crate::transfer::{self, parse_confirmation, Confirm, DownloadOffer, DownloadReport, UploadOutcome};

/// Text shown before each command line.
pub const PROMPT: &str = "(fileshell) ";

const CONFIRM_PROMPT: &str = "Do you want to proceed? (y/n) ";

const HELP: &str = "\
Commands:
  pwd          print the remote working directory
  ls           list the remote working directory
  cd <dir>     change the remote working directory
  mkd <dir>    create a remote directory
  del <name>   delete a remote file or empty directory
  upl <path>   upload a local file
  dnl <name>   download a remote file
  help         show this text
  bye          close the session and exit";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Pwd,
    List,
    Chdir(String),
    Mkdir(String),
    Delete(String),
    Upload(PathBuf),
    Download(String),
    Help,
    Exit,
    /// A blank line.
    Nothing,
}

impl ShellCommand {
    /// Parses a line. Everything after the command word, trimmed, is the
    /// argument, so names may contain spaces.
    ///
    /// Errors are usage messages to print; nothing has been sent.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let argument = |usage: &str| {
            if rest.is_empty() {
                Err(format!("Usage: {}", usage))
            } else {
                Ok(rest.to_string())
            }
        };

        match word {
            "" => Ok(ShellCommand::Nothing),
            "pwd" => Ok(ShellCommand::Pwd),
            "ls" => Ok(ShellCommand::List),
            "cd" => argument("cd <dir>").map(ShellCommand::Chdir),
            "mkd" => argument("mkd <dir>").map(ShellCommand::Mkdir),
            "del" => argument("del <name>").map(ShellCommand::Delete),
            "upl" => argument("upl <path>").map(|p| ShellCommand::Upload(PathBuf::from(p))),
            "dnl" => argument("dnl <name>").map(ShellCommand::Download),
            "help" | "?" => Ok(ShellCommand::Help),
            "bye" => Ok(ShellCommand::Exit),
            other => Err(format!(
                "Unknown command: {}. Type 'help' for a list of commands.",
                other
            )),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The user typed `bye`.
    UserExit,
    /// Input ran out.
    EndOfInput,
    /// A message failed verification and the session was closed.
    VerificationFailed,
    /// The transport went away.
    ConnectionLost,
}

/// Transfer settings used by `upl` and `dnl`.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub chunk_size: usize,
    pub download_dir: PathBuf,
}

/// The interactive shell over one session.
pub struct Shell<'s, C, R, W> {
    session: &'s mut Session<C>,
    input: R,
    output: W,
    settings: ShellSettings,
}

impl<'s, C, R, W> Shell<'s, C, R, W>
where
    C: SecureChannel,
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(session: &'s mut Session<C>, input: R, output: W, settings: ShellSettings) -> Self {
        Self {
            session,
            input,
            output,
            settings,
        }
    }

    /// Everything written so far.
    pub fn output(&self) -> &W {
        &self.output
    }

    /// Runs until `bye`, end of input or a fatal session error.
    ///
    /// Only terminal I/O errors are returned; session problems are printed
    /// and decide the [`ExitReason`].
    pub async fn run(&mut self) -> io::Result<ExitReason> {
        let mut line = String::new();
        loop {
            self.output.write_all(PROMPT.as_bytes()).await?;
            self.output.flush().await?;

            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                self.say("").await?;
                self.session.close(CloseReason::UserExit).await;
                return Ok(ExitReason::EndOfInput);
            }

            let command = match ShellCommand::parse(&line) {
                Ok(command) => command,
                Err(usage) => {
                    self.say(&usage).await?;
                    continue;
                }
            };

            if let Some(reason) = self.dispatch(command).await? {
                return Ok(reason);
            }
        }
    }

    async fn dispatch(&mut self, command: ShellCommand) -> io::Result<Option<ExitReason>> {
        let result = match command {
            ShellCommand::Nothing => return Ok(None),
            ShellCommand::Help => {
                self.say(HELP).await?;
                return Ok(None);
            }
            ShellCommand::Exit => {
                self.say("Closing connection with server...").await?;
                self.session.close(CloseReason::UserExit).await;
                return Ok(Some(ExitReason::UserExit));
            }
            ShellCommand::Pwd => self.simple(CommandRequest::pwd(), None).await,
            ShellCommand::List => self.simple(CommandRequest::list(), Some("[empty]")).await,
            ShellCommand::Chdir(dir) => self.simple(CommandRequest::chdir(dir), None).await,
            ShellCommand::Mkdir(dir) => self.simple(CommandRequest::mkdir(dir), None).await,
            ShellCommand::Delete(name) => self.simple(CommandRequest::delete(name), None).await,
            ShellCommand::Upload(path) => self.upload(path).await,
            ShellCommand::Download(name) => self.download(name).await,
        };

        match result {
            Ok(()) => Ok(None),
            Err(DispatchError::Io(e)) => Err(e),
            Err(DispatchError::Session(e)) => self.report(e).await,
        }
    }

    /// Runs a command with no transfer phase and prints its detail text.
    async fn simple(
        &mut self,
        request: CommandRequest,
        when_empty: Option<&str>,
    ) -> Result<(), DispatchError> {
        let response = self.session.execute(request).await?;
        match response.outcome {
            CommandOutcome::Success => {
                let detail = response.detail.unwrap_or_default();
                match (detail.trim_end(), when_empty) {
                    ("", Some(placeholder)) => self.say(placeholder).await?,
                    ("", None) => {}
                    (text, _) => self.say(text).await?,
                }
            }
            _ => self.remote_error(&response).await?,
        }
        Ok(())
    }

    async fn upload(&mut self, path: PathBuf) -> Result<(), DispatchError> {
        // "Starting upload..." only follows a server acceptance. Transfer
        // errors are raised after the acceptance, never before it.
        match transfer::upload(&mut *self.session, &path, self.settings.chunk_size).await {
            Ok(UploadOutcome::Completed(_)) => {
                self.say("Starting upload...").await?;
                self.say("Upload completed.").await?;
            }
            Ok(UploadOutcome::Rejected { reason, .. }) => {
                self.say(&format!("Remote error: {}", reason)).await?
            }
            Err(err @ ShellError::Transfer(_)) => {
                self.say("Starting upload...").await?;
                return Err(DispatchError::Session(err));
            }
            Err(err) => return Err(DispatchError::Session(err)),
        }
        Ok(())
    }

    async fn download(&mut self, name: String) -> Result<(), DispatchError> {
        let mut prompt = Prompt {
            input: &mut self.input,
            output: &mut self.output,
        };
        let report = transfer::download(
            &mut *self.session,
            &name,
            &self.settings.download_dir,
            &mut prompt,
        )
        .await?;

        match report {
            DownloadReport::Rejected { reason, .. } => {
                self.say(&format!("Remote error: {}", reason)).await?
            }
            DownloadReport::Cancelled(_) => self.say("Download canceled.").await?,
            DownloadReport::Completed { digest_matches, .. } => {
                if !digest_matches {
                    self.say("Warning: File hash mismatch!").await?;
                }
                self.say("Download completed.").await?;
            }
        }
        Ok(())
    }

    async fn remote_error(&mut self, response: &CommandResponse) -> io::Result<()> {
        let reason = response.detail.as_deref().unwrap_or("no reason given");
        self.say(&format!("Remote error: {}", reason)).await
    }

    /// Prints a session error. Returns the exit reason when it ended the
    /// session.
    async fn report(&mut self, err: ShellError) -> io::Result<Option<ExitReason>> {
        self.say(&format!("{}: {}", err.category(), err)).await?;
        if !err.is_fatal() {
            return Ok(None);
        }

        let reason = match self.session.close_reason() {
            Some(CloseReason::VerificationFailed) => ExitReason::VerificationFailed,
            _ => ExitReason::ConnectionLost,
        };
        let message = match reason {
            ExitReason::VerificationFailed => "Verification failed. Closing connection.",
            _ => "Connection lost. Closing session.",
        };
        self.say(message).await?;
        Ok(Some(reason))
    }

    async fn say(&mut self, text: &str) -> io::Result<()> {
        say(&mut self.output, text).await
    }
}

/// Failures inside one dispatched command.
enum DispatchError {
    /// Terminal I/O; ends the loop.
    Io(io::Error),
    /// Session error; printed.
    Session(ShellError),
}

impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        DispatchError::Io(err)
    }
}

impl From<ShellError> for DispatchError {
    fn from(err: ShellError) -> Self {
        DispatchError::Session(err)
    }
}

/// The download confirmation prompt on the shell's own input and output.
struct Prompt<'a, R, W> {
    input: &'a mut R,
    output: &'a mut W,
}

impl<R, W> Prompt<'_, R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ask(&mut self, offer: &DownloadOffer) -> io::Result<bool> {
        say(&mut *self.output, &format!("File size: {}", offer.size)).await?;
        say(&mut *self.output, &format!("File hash: {}", offer.digest_hex())).await?;

        let mut line = String::new();
        loop {
            self.output.write_all(CONFIRM_PROMPT.as_bytes()).await?;
            self.output.flush().await?;

            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                return Ok(false);
            }
            if let Some(answer) = parse_confirmation(&line) {
                if answer {
                    say(&mut *self.output, "Starting download...").await?;
                }
                return Ok(answer);
            }
        }
    }
}

impl<R, W> Confirm for Prompt<'_, R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn confirm<'a>(
        &'a mut self,
        offer: &'a DownloadOffer,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.ask(offer).await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not read confirmation, declining");
                    false
                }
            }
        })
    }
}

async fn say<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> io::Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
