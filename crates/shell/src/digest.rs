//! Streaming SHA-256 over local files.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use protocol::DIGEST_LENGTH;
use sha2::{Digest, Sha256};

use crate::error::ShellError;

/// Default read and transfer chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Incremental SHA-256 plus a running byte count.
#[derive(Debug, Clone, Default)]
pub struct DigestAccumulator {
    hasher: Sha256,
    bytes: u64,
}

impl DigestAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finishes the digest, returning `(size, digest)`.
    pub fn finalize(self) -> (u64, [u8; DIGEST_LENGTH]) {
        let hash = self.hasher.finalize();
        let mut digest = [0u8; DIGEST_LENGTH];
        digest.copy_from_slice(&hash);
        (self.bytes, digest)
    }
}

/// Name, size and digest of a file about to be moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Base name, without any path separators.
    pub name: String,
    /// Length in bytes.
    pub size: u64,
    /// SHA-256 over exactly `size` bytes.
    pub digest: [u8; DIGEST_LENGTH],
}

impl FileDescriptor {
    /// Builds the descriptor for a local regular file.
    pub fn from_path(path: &Path, chunk_size: usize) -> Result<Self, ShellError> {
        let name = base_name(path).ok_or_else(|| {
            ShellError::local_io(
                path,
                std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let (size, digest) = digest_file(path, chunk_size)?;
        Ok(Self { name, size, digest })
    }

    /// Hex form of the digest.
    pub fn digest_hex(&self) -> String {
        to_hex(&self.digest)
    }
}

/// Reads `path` in `chunk_size` pieces and returns its size and SHA-256.
///
/// Fails with [`ShellError::LocalIo`] if the path is missing, unreadable or
/// not a regular file.
pub fn digest_file(path: &Path, chunk_size: usize) -> Result<(u64, [u8; DIGEST_LENGTH]), ShellError> {
    let metadata = std::fs::metadata(path).map_err(|e| ShellError::local_io(path, e))?;
    if !metadata.is_file() {
        return Err(ShellError::local_io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
        ));
    }

    let mut file = File::open(path).map_err(|e| ShellError::local_io(path, e))?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut accumulator = DigestAccumulator::new();

    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ShellError::local_io(path, e)),
        };
        accumulator.update(&buffer[..bytes_read]);
    }

    Ok(accumulator.finalize())
}

/// Final path component as UTF-8, if there is one.
pub fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// Lowercase hex encoding of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_digest_matches_one_shot_hash() {
        let temp_dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let path = create_test_file(temp_dir.path(), "data.bin", &content);

        let (size, digest) = digest_file(&path, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(size, 5000);
        assert_eq!(digest.as_slice(), Sha256::digest(&content).as_slice());
    }

    #[test]
    fn test_digest_is_deterministic_across_chunk_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let path = create_test_file(temp_dir.path(), "report.txt", b"hello world\n");

        let first = digest_file(&path, DEFAULT_CHUNK_SIZE).unwrap();
        let second = digest_file(&path, DEFAULT_CHUNK_SIZE).unwrap();
        let tiny_chunks = digest_file(&path, 5).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, tiny_chunks);
        assert_eq!(first.0, 12);
    }

    #[test]
    fn test_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = create_test_file(temp_dir.path(), "empty", b"");

        let (size, digest) = digest_file(&path, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(size, 0);
        assert_eq!(
            to_hex(&digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_missing_file_is_local_io() {
        let temp_dir = TempDir::new().unwrap();
        let err = digest_file(&temp_dir.path().join("nope.txt"), DEFAULT_CHUNK_SIZE).unwrap_err();
        assert!(matches!(err, ShellError::LocalIo { .. }));
    }

    #[test]
    fn test_directory_is_local_io() {
        let temp_dir = TempDir::new().unwrap();
        let err = FileDescriptor::from_path(temp_dir.path(), DEFAULT_CHUNK_SIZE).unwrap_err();
        assert!(matches!(err, ShellError::LocalIo { .. }));
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_descriptor_uses_base_name() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        let path = create_test_file(&nested, "report.txt", b"hello world\n");

        let descriptor = FileDescriptor::from_path(&path, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(descriptor.name, "report.txt");
        assert_eq!(descriptor.size, 12);
        assert!(!descriptor.name.contains(std::path::MAIN_SEPARATOR));
        assert_eq!(descriptor.digest_hex().len(), 64);
    }

    #[test]
    fn test_accumulator_counts_bytes() {
        let mut accumulator = DigestAccumulator::new();
        accumulator.update(b"hello ");
        accumulator.update(b"world\n");
        assert_eq!(accumulator.bytes(), 12);

        let (size, digest) = accumulator.finalize();
        assert_eq!(size, 12);
        assert_eq!(digest.as_slice(), Sha256::digest(b"hello world\n").as_slice());
    }
}
