//! # FileShell Client Library
//!
//! The client side of a FileShell session: an authenticated user issuing
//! directory and file-transfer commands against a remote filesystem over a
//! [`protocol::SecureChannel`].
//!
//! ## Overview
//!
//! - **Digests**: streaming SHA-256 over local files
//! - **Session**: one command, one verified response; fail-closed on any
//!   channel-level verification failure
//! - **Transfers**: upload and download orchestration with a user
//!   confirmation gate in front of downloads
//! - **Shell**: the interactive `pwd`/`ls`/`cd`/`mkd`/`del`/`upl`/`dnl` loop
//! - **Connect**: TCP, Noise handshake with optional server key pinning, login
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use protocol::messages::{CommandRequest, LoginRequest};
//! use protocol::StaticKeypair;
//! use shell::connect::{connect, login, ConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let keypair = StaticKeypair::generate()?;
//!     let options = ConnectOptions {
//!         address: "localhost:5150".to_string(),
//!         timeout: Duration::from_secs(10),
//!         server_key: None,
//!     };
//!
//!     let channel = connect(&options, &keypair).await?;
//!     let mut session = login(channel, LoginRequest::new("alice", "aaa")).await?;
//!
//!     let response = session.execute(CommandRequest::pwd()).await?;
//!     println!("{:?}", response.detail);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connect`]: Session establishment
//! - [`digest`]: File digests
//! - [`error`]: Error taxonomy
//! - [`session`]: Command/response exchange and fail-closed handling
//! - [`shell`]: Interactive command loop
//! - [`transfer`]: Upload and download orchestration

pub mod config;
pub mod connect;
pub mod digest;
pub mod error;
pub mod session;
pub mod shell;
pub mod transfer;

#[cfg(test)]
mod testing;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use error::ShellError;
pub use session::{CloseReason, Session};
pub use shell::{ExitReason, Shell, ShellCommand, ShellSettings};
pub use transfer::{
    download, parse_confirmation, upload, Confirm, DownloadOffer, DownloadReport, TransferAttempt,
    TransferDirection, TransferState, UploadOutcome,
};
