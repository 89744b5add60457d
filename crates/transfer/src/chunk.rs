// Path: crates/transfer/src/chunk.rs
//! Chunk production over a resource byte stream.

use gantry_types::error::TransferError;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One unit of send-and-acknowledge. Ephemeral; never persisted.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of this chunk within the resource stream.
    pub offset: u64,
    /// Payload; at most the current chunk size.
    pub data: Vec<u8>,
    /// XXH3-64 of the payload.
    pub checksum: u64,
    /// Set on the last chunk of the stream.
    pub is_final: bool,
}

impl Chunk {
    /// Offset immediately after this chunk; the value the receiver acks.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// The fast per-chunk checksum.
pub fn chunk_checksum(data: &[u8]) -> u64 {
    twox_hash::xxh3::hash64(data)
}

/// Reads a resource stream into chunks while maintaining the running
/// SHA-256 digest of everything produced.
pub struct ChunkReader<R> {
    inner: R,
    offset: u64,
    total: u64,
    digest: Sha256,
}

impl<R: AsyncRead + Unpin + Send> ChunkReader<R> {
    /// A reader positioned at the start of the stream.
    pub fn new(inner: R, total: u64) -> Self {
        Self {
            inner,
            offset: 0,
            total,
            digest: Sha256::new(),
        }
    }

    /// A reader resuming at `resume_offset`. The bytes before the resume
    /// point are consumed from `inner` and folded into the digest so the
    /// end-to-end SHA-256 still covers the whole stream.
    pub async fn resume(
        inner: R,
        total: u64,
        resume_offset: u64,
    ) -> Result<Self, TransferError> {
        let mut reader = Self::new(inner, total);
        let mut remaining = resume_offset;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(buf.len() as u64) as usize;
            reader
                .inner
                .read_exact(&mut buf[..take])
                .await
                .map_err(|e| TransferError::Resource(format!("seeding resume digest: {e}")))?;
            reader.digest.update(&buf[..take]);
            remaining -= take as u64;
        }
        reader.offset = resume_offset;
        Ok(reader)
    }

    /// Produces the next chunk of at most `chunk_size` bytes, or `None`
    /// when the stream is fully consumed.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> Result<Option<Chunk>, TransferError> {
        if self.offset >= self.total {
            return Ok(None);
        }
        let remaining = self.total - self.offset;
        let take = remaining.min(chunk_size as u64) as usize;
        let mut data = vec![0u8; take];
        self.inner
            .read_exact(&mut data)
            .await
            .map_err(|e| TransferError::Resource(format!("reading resource stream: {e}")))?;
        self.digest.update(&data);

        let chunk = Chunk {
            offset: self.offset,
            checksum: chunk_checksum(&data),
            is_final: self.offset + take as u64 >= self.total,
            data,
        };
        self.offset = chunk.end_offset();
        Ok(Some(chunk))
    }

    /// Current read position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Hex SHA-256 of everything produced so far.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest.clone().finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn chunks_cover_the_stream_exactly() {
        let data = payload(2_500_000);
        let mut reader = ChunkReader::new(&data[..], data.len() as u64);

        let mut reassembled = Vec::new();
        let mut finals = 0;
        while let Some(chunk) = reader.next_chunk(1024 * 1024).await.unwrap() {
            assert_eq!(chunk.offset, reassembled.len() as u64);
            assert_eq!(chunk.checksum, chunk_checksum(&chunk.data));
            if chunk.is_final {
                finals += 1;
            }
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(finals, 1);
        assert_eq!(reassembled, data);
        assert_eq!(
            reader.digest_hex(),
            hex::encode(Sha256::digest(&data))
        );
    }

    #[tokio::test]
    async fn resume_digest_covers_skipped_bytes() {
        let data = payload(300_000);
        let resume_at = 100_000u64;
        let mut reader = ChunkReader::resume(&data[..], data.len() as u64, resume_at)
            .await
            .unwrap();
        assert_eq!(reader.offset(), resume_at);

        while reader.next_chunk(64 * 1024).await.unwrap().is_some() {}
        assert_eq!(reader.digest_hex(), hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn empty_stream_produces_no_chunks() {
        let mut reader = ChunkReader::new(&[][..], 0);
        assert!(reader.next_chunk(1024).await.unwrap().is_none());
    }
}
