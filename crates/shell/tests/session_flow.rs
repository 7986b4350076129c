//! End-to-end tests for the FileShell client.
//!
//! Each test runs the real stack (Noise handshake, framing, envelopes,
//! login, session, transfers) against a scripted peer on the other end of
//! an in-memory duplex stream.

use std::future::Future;
use std::pin::Pin;

use protocol::messages::{
    CommandKind, CommandOutcome, CommandResponse, DownloadControl, FileChunk, LoginResponse,
    UploadReceipt,
};
use protocol::{Message, NoiseChannel, StaticKeypair, DIGEST_LENGTH};
use sha2::{Digest, Sha256};
use shell::connect::{handshake, login};
use shell::{
    download, upload, CloseReason, Confirm, DownloadOffer, DownloadReport, ExitReason, Session,
    Shell, ShellError, ShellSettings, UploadOutcome,
};
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

const REPORT: &[u8] = b"hello world\n";

type ServerChannel = NoiseChannel<DuplexStream>;

struct Accept;

impl Confirm for Accept {
    fn confirm<'a>(
        &'a mut self,
        _offer: &'a DownloadOffer,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async { true })
    }
}

fn sha(data: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

/// Starts a scripted server that accepts the handshake and the login of
/// `alice`, then hands the channel to `script`.
fn spawn_server<F, Fut>(
    server_io: DuplexStream,
    keypair: StaticKeypair,
    script: F,
) -> JoinHandle<()>
where
    F: FnOnce(ServerChannel) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut channel = NoiseChannel::accept(server_io, &keypair).await.unwrap();

        let request = match channel.receive_message().await.unwrap() {
            Message::LoginRequest(request) => request,
            other => panic!("expected login, got {:?}", other),
        };
        assert_eq!(request.username, "alice");
        channel
            .send_message(Message::LoginResponse(LoginResponse {
                request_digest: request.fingerprint().unwrap().to_vec(),
                accepted: request.password == "aaa",
                reason: None,
            }))
            .await
            .unwrap();

        script(channel).await;
    })
}

async fn connect_client(client_io: DuplexStream, server: &StaticKeypair) -> Session<NoiseChannel<DuplexStream>> {
    let client = StaticKeypair::generate().unwrap();
    let server_key = server.public();
    let channel = handshake(client_io, &client, Some(&server_key)).await.unwrap();
    login(channel, protocol::messages::LoginRequest::new("alice", "aaa"))
        .await
        .unwrap()
}

async fn expect_command(channel: &mut ServerChannel, kind: CommandKind) -> [u8; DIGEST_LENGTH] {
    match channel.receive_message().await.unwrap() {
        Message::Command(request) => {
            assert_eq!(request.command, kind);
            request.fingerprint().unwrap()
        }
        other => panic!("expected command, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let server = StaticKeypair::generate().unwrap();
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    let server_task = spawn_server(server_io, server.clone(), |mut channel| async move {
        let request = match channel.receive_message().await.unwrap() {
            Message::Command(request) => request,
            other => panic!("expected upload, got {:?}", other),
        };
        assert_eq!(request.command, CommandKind::Upload);
        assert_eq!(request.argument.as_deref(), Some("report.txt"));
        assert_eq!(request.size, Some(REPORT.len() as u64));
        channel
            .send_message(Message::CommandResult(CommandResponse::new(
                request.fingerprint().unwrap(),
                CommandOutcome::Success,
                None,
            )))
            .await
            .unwrap();

        let mut stored = Vec::new();
        loop {
            match channel.receive_message().await.unwrap() {
                Message::FileChunk(chunk) => {
                    assert!(chunk.data.len() <= 5);
                    stored.extend_from_slice(&chunk.data);
                    if chunk.last {
                        break;
                    }
                }
                other => panic!("expected chunk, got {:?}", other),
            }
        }
        assert_eq!(stored, REPORT);
        channel
            .send_message(Message::UploadReceipt(UploadReceipt {
                size: stored.len() as u64,
                digest: sha(&stored).to_vec(),
            }))
            .await
            .unwrap();

        let digest = expect_command(&mut channel, CommandKind::Download).await;
        channel
            .send_message(Message::CommandResult(CommandResponse::download_offer(
                digest,
                stored.len() as u64,
                sha(&stored),
            )))
            .await
            .unwrap();
        assert_eq!(
            channel.receive_message().await.unwrap(),
            Message::DownloadControl(DownloadControl::Ready)
        );
        let pieces: Vec<&[u8]> = stored.chunks(4).collect();
        for (i, piece) in pieces.iter().enumerate() {
            channel
                .send_message(Message::FileChunk(FileChunk {
                    data: piece.to_vec(),
                    last: i + 1 == pieces.len(),
                }))
                .await
                .unwrap();
        }
    });

    let local = TempDir::new().unwrap();
    let source = local.path().join("report.txt");
    std::fs::write(&source, REPORT).unwrap();
    let downloads = TempDir::new().unwrap();

    let mut session = connect_client(client_io, &server).await;

    let outcome = upload(&mut session, &source, 5).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed(ref d) if d.size == 12));

    let report = download(&mut session, "report.txt", downloads.path(), &mut Accept)
        .await
        .unwrap();
    match report {
        DownloadReport::Completed {
            path,
            digest_matches,
            ..
        } => {
            assert!(digest_matches);
            assert_eq!(std::fs::read(path).unwrap(), REPORT);
        }
        other => panic!("unexpected report: {:?}", other),
    }

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_rejected_download_leaves_session_usable() {
    let server = StaticKeypair::generate().unwrap();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_task = spawn_server(server_io, server.clone(), |mut channel| async move {
        let digest = expect_command(&mut channel, CommandKind::Download).await;
        channel
            .send_message(Message::CommandResult(CommandResponse::new(
                digest,
                CommandOutcome::Reject,
                Some("file not found".into()),
            )))
            .await
            .unwrap();

        let digest = expect_command(&mut channel, CommandKind::Pwd).await;
        channel
            .send_message(Message::CommandResult(CommandResponse::new(
                digest,
                CommandOutcome::Success,
                Some("/home/alice".into()),
            )))
            .await
            .unwrap();
    });

    let downloads = TempDir::new().unwrap();
    let mut session = connect_client(client_io, &server).await;

    let report = download(&mut session, "missing.txt", downloads.path(), &mut Accept)
        .await
        .unwrap();
    assert!(matches!(
        report,
        DownloadReport::Rejected { outcome: CommandOutcome::Reject, ref reason } if reason == "file not found"
    ));
    assert_eq!(std::fs::read_dir(downloads.path()).unwrap().count(), 0);

    let response = session
        .execute(protocol::messages::CommandRequest::pwd())
        .await
        .unwrap();
    assert_eq!(response.detail.as_deref(), Some("/home/alice"));

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_wrong_response_digest_ends_shell() {
    let server = StaticKeypair::generate().unwrap();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_task = spawn_server(server_io, server.clone(), |mut channel| async move {
        expect_command(&mut channel, CommandKind::List).await;
        channel
            .send_message(Message::CommandResult(CommandResponse::new(
                [0u8; DIGEST_LENGTH],
                CommandOutcome::Success,
                Some("secrets.txt".into()),
            )))
            .await
            .unwrap();
    });

    let downloads = TempDir::new().unwrap();
    let mut session = connect_client(client_io, &server).await;
    let settings = ShellSettings {
        chunk_size: 1024,
        download_dir: downloads.path().to_path_buf(),
    };

    let output = {
        let mut shell = Shell::new(&mut session, &b"ls\npwd\nbye\n"[..], Vec::new(), settings);
        let reason = shell.run().await.unwrap();
        assert_eq!(reason, ExitReason::VerificationFailed);
        String::from_utf8(shell.output().clone()).unwrap()
    };

    assert!(!output.contains("secrets.txt"));
    assert!(output.ends_with("Verification failed. Closing connection.\n"));
    assert_eq!(session.close_reason(), Some(CloseReason::VerificationFailed));
    assert!(matches!(
        session.execute(protocol::messages::CommandRequest::pwd()).await,
        Err(ShellError::SessionClosed)
    ));

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_refused_login() {
    let server = StaticKeypair::generate().unwrap();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server_task = spawn_server(server_io, server.clone(), |_| async {});

    let client = StaticKeypair::generate().unwrap();
    let channel = handshake(client_io, &client, None).await.unwrap();
    let err = login(channel, protocol::messages::LoginRequest::new("alice", "wrong"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("login refused"));

    server_task.await.unwrap();
}
