//! Print MessagePack test vectors for server implementations.
//!
//! Each command vector is followed by the request digest a conforming server
//! must echo in its `CommandResult`.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;

fn main() {
    let requests = [
        ("pwd", CommandRequest::pwd()),
        ("list", CommandRequest::list()),
        ("chdir", CommandRequest::chdir("reports")),
        ("mkdir", CommandRequest::mkdir("archive")),
        ("delete", CommandRequest::delete("old.txt")),
        ("upload", CommandRequest::upload("report.txt", 12, [0xd1; DIGEST_LENGTH])),
        ("download", CommandRequest::download("missing.txt")),
    ];

    for (sequence, (name, request)) in requests.into_iter().enumerate() {
        let digest = request.fingerprint().expect("fingerprint failed");
        let envelope = Envelope::new(sequence as u64 + 1, Message::Command(request));
        print_test_vector(name, &envelope);
        println!("{}_request_digest = {}", name, hex::encode(digest));
    }

    let rejected = Envelope::new(
        1,
        Message::CommandResult(CommandResponse::new(
            [0; DIGEST_LENGTH],
            CommandOutcome::Reject,
            Some("file not found".to_string()),
        )),
    );
    print_test_vector("reject", &rejected);

    let offer = Envelope::new(
        2,
        Message::CommandResult(CommandResponse::download_offer(
            [0; DIGEST_LENGTH],
            12,
            [0xd1; DIGEST_LENGTH],
        )),
    );
    print_test_vector("download_offer", &offer);

    let chunk = Envelope::new(
        3,
        Message::FileChunk(FileChunk {
            data: b"hello world\n".to_vec(),
            last: true,
        }),
    );
    print_test_vector("file_chunk", &chunk);

    let receipt = Envelope::new(
        4,
        Message::UploadReceipt(UploadReceipt {
            size: 12,
            digest: vec![0xd1; DIGEST_LENGTH],
        }),
    );
    print_test_vector("upload_receipt", &receipt);

    let cancel = Envelope::new(5, Message::DownloadControl(DownloadControl::Cancel));
    print_test_vector("download_cancel", &cancel);
}

fn print_test_vector(name: &str, envelope: &Envelope) {
    let bytes = envelope.to_msgpack().expect("serialization failed");
    println!("{} = {}", name, hex::encode(bytes));
}
