use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::Result;

/// Read size used while hashing
const CHUNK_SIZE: usize = 64 * 1024;

/// Fingerprint of an upload plus the number of bytes it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub fingerprint: String,
    pub byte_size: i64,
}

/// SHA-256 content hasher
pub struct ContentHasher;

impl ContentHasher {
    /// Hash the whole stream in fixed-size chunks and rewind it to the start
    pub async fn fingerprint<R>(reader: &mut R) -> Result<ContentDigest>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        reader.seek(SeekFrom::Start(0)).await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        reader.seek(SeekFrom::Start(0)).await?;

        Ok(ContentDigest {
            fingerprint: hex::encode(hasher.finalize()),
            byte_size: total as i64,
        })
    }

    /// Fingerprint of an in-memory buffer
    pub fn fingerprint_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// 64 lowercase hex characters
    pub fn is_fingerprint(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}
