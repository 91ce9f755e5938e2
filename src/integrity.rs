use md5::{Digest, Md5};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Incremental MD5 over a byte stream as it is written to staging.
///
/// MD5 is an integrity check against a trusted server, not a security
/// control; the manifest carries MD5 sums.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Md5,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self { hasher: Md5::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Final digest as lower-case hex.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Compute the MD5 digest of a file asynchronously, as lower-case hex.
/// Used to re-verify the whole staging file after a resumed download,
/// so a corrupted earlier segment is still caught.
pub async fn md5_file(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a computed digest against the manifest-declared one.
pub fn verify(expected: &str, actual: &str) -> Result<(), IntegrityError> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            expected: expected.to_ascii_lowercase(),
            actual: actual.to_ascii_lowercase(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn streaming_digest_matches_known_vector() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        let mut digest = StreamingDigest::new();
        digest.update(b"a");
        digest.update(b"bc");
        assert_eq!(digest.finish(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn md5_file_matches_known_vector() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();
        let digest = md5_file(f.path()).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn verify_is_case_insensitive() {
        assert!(verify("ABC123", "abc123").is_ok());
        let err = verify("abc123", "def456").unwrap_err();
        match err {
            IntegrityError::Mismatch { expected, actual } => {
                assert_eq!(expected, "abc123");
                assert_eq!(actual, "def456");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
