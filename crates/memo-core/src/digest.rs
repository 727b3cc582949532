//! Streaming file digests.
//!
//! All file identity in memo is content-addressed: a file is identified by
//! the lowercase hex SHA-256 of its byte content. No newline or encoding
//! normalization is applied; the digest is over the raw bytes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::DigestConfig;
use crate::errors::MemoResult;

/// Digest a file's bytes with the default buffer size.
pub fn digest_file(path: impl AsRef<Path>) -> MemoResult<String> {
    digest_file_with(path, &DigestConfig::default())
}

/// Digest a file's bytes, streaming through a fixed-size buffer.
///
/// The file is read incrementally so inputs larger than memory are fine.
/// A file that vanished between the caller's existence check and the open
/// here surfaces as an i/o error; hit-check callers treat that as a miss.
pub fn digest_file_with(path: impl AsRef<Path>, config: &DigestConfig) -> MemoResult<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; config.buffer_bytes.max(1)];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest the concatenated bytes of several files with one hasher, in
/// order. Used for an executable plus its declared co-dependencies:
/// upgrading any one of them changes the combined digest.
pub fn digest_files<P: AsRef<Path>>(paths: &[P]) -> MemoResult<String> {
    let config = DigestConfig::default();
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; config.buffer_bytes];
    for path in paths {
        let mut file = File::open(path.as_ref())?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest an in-memory byte slice. Used for fingerprint material that never
/// touches the filesystem.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
